// config.rs: Validated run configuration
//
// One struct tree, every field defaulted, so a JSON file only needs to name
// what it overrides. `validate()` runs once before any frame is processed;
// nothing downstream re-checks these invariants.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::camera::CameraModel;
use crate::error::{GeolocError, GeolocResult};

// ─── Projection ──────────────────────────────────────────────────────────────

/// How the per-record error estimate is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorModel {
    /// Receiver error only, as reported by the quality evaluator
    GpsOnly,
    /// Receiver error combined with 1% altitude error and 1° attitude error
    Combined,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub ground_elevation_m: f64,
    pub min_grazing_angle_deg: f64,
    pub nadir_tolerance_deg: f64,
    pub use_nadir_fast_path: bool,
    pub edge_margin_px: f64,
    pub error_model: ErrorModel,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            ground_elevation_m: 0.0,
            min_grazing_angle_deg: 10.0,
            nadir_tolerance_deg: 1e-3,
            use_nadir_fast_path: true,
            edge_margin_px: 50.0,
            error_model: ErrorModel::GpsOnly,
        }
    }
}

// ─── GPS quality ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub enabled: bool,
    pub invalid_below_level: u8,
    pub min_gps_level: u8,
    pub min_satellite_count: u32,
    pub skip_on_low_quality: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invalid_below_level: 1,
            min_gps_level: 3,
            min_satellite_count: 10,
            skip_on_low_quality: true,
        }
    }
}

// ─── Synchronization ─────────────────────────────────────────────────────────

/// How a frame is paired with a pose sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// Nearest sample within `timestamp_tolerance_ms`
    Timestamp,
    /// Sample carrying the frame's number (subtitle logs with `FrameCnt`)
    FrameNumber,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub method: SyncMethod,
    pub timestamp_tolerance_ms: i64,
    pub buffer_capacity: usize,
    pub consecutive_failure_threshold: u32,
    pub recheck_interval: u32,
    pub recovery_checks: u32,
    pub evict_consumed: bool,
    pub interpolate: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            method: SyncMethod::Timestamp,
            timestamp_tolerance_ms: 100,
            buffer_capacity: 100,
            consecutive_failure_threshold: 30,
            recheck_interval: 10,
            recovery_checks: 3,
            evict_consumed: true,
            interpolate: false,
        }
    }
}

// ─── Deduplication ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub distance_threshold_m: f64,
    pub min_quality_score: f64,
    pub edge_penalty: f64,
    pub ocr_gps_factor: f64,
    pub use_spatial_index: bool,
    pub window_ms: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_threshold_m: 5.0,
            min_quality_score: 0.0,
            edge_penalty: 0.5,
            ocr_gps_factor: 0.6,
            use_spatial_index: true,
            window_ms: 10_000,
        }
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_queue_capacity: usize,
    pub idle_sleep_ms: u64,
    /// Deduplicate over tumbling windows while running instead of once at the end
    pub streaming_dedup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 30,
            idle_sleep_ms: 1,
            streaming_dedup: false,
        }
    }
}

// ─── Root ────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocConfig {
    pub camera: CameraModel,
    pub projection: ProjectionConfig,
    pub quality: QualityConfig,
    pub sync: SyncConfig,
    pub dedup: DedupConfig,
    pub pipeline: PipelineConfig,
}

impl GeolocConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> GeolocResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: GeolocConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!(
            "Loaded config from {} (camera {}x{}, f={} mm)",
            path.as_ref().display(),
            config.camera.image_width,
            config.camera.image_height,
            config.camera.focal_length_mm
        );
        Ok(config)
    }

    pub fn validate(&self) -> GeolocResult<()> {
        self.camera.validate()?;

        let p = &self.projection;
        if !(0.0..90.0).contains(&p.min_grazing_angle_deg) {
            return Err(GeolocError::InvalidConfig(format!(
                "min_grazing_angle_deg must be in [0, 90), got {}",
                p.min_grazing_angle_deg
            )));
        }
        if p.edge_margin_px < 0.0 || p.nadir_tolerance_deg < 0.0 {
            return Err(GeolocError::InvalidConfig(
                "edge_margin_px and nadir_tolerance_deg must be non-negative".into(),
            ));
        }

        let q = &self.quality;
        if q.invalid_below_level > q.min_gps_level {
            return Err(GeolocError::InvalidConfig(format!(
                "invalid_below_level ({}) exceeds min_gps_level ({})",
                q.invalid_below_level, q.min_gps_level
            )));
        }

        let s = &self.sync;
        if s.timestamp_tolerance_ms < 0 {
            return Err(GeolocError::InvalidConfig("timestamp_tolerance_ms must be >= 0".into()));
        }
        if s.buffer_capacity == 0 {
            return Err(GeolocError::InvalidConfig("buffer_capacity must be > 0".into()));
        }
        if s.consecutive_failure_threshold == 0 || s.recheck_interval == 0 || s.recovery_checks == 0 {
            return Err(GeolocError::InvalidConfig(
                "failover thresholds must all be > 0".into(),
            ));
        }

        let d = &self.dedup;
        if !(d.distance_threshold_m > 0.0) {
            return Err(GeolocError::InvalidConfig(format!(
                "distance_threshold_m must be > 0, got {}",
                d.distance_threshold_m
            )));
        }
        if d.window_ms <= 0 {
            return Err(GeolocError::InvalidConfig("dedup window_ms must be > 0".into()));
        }

        if self.pipeline.frame_queue_capacity == 0 {
            return Err(GeolocError::InvalidConfig("frame_queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}
