// sync.rs: Frame ↔ pose alignment across prioritized telemetry sources
//
// State machine:
//   PrimaryActive ──K misses / unavailable──▶ Degraded(i) ──...──▶ AllFailed
//        ▲                                        │                    │
//        └──── N consecutive successful re-checks ┴────────────────────┘
//
// Only the active source answers lookups. While degraded or all-failed, every
// `recheck_interval` lookups the higher-priority sources are re-checked (read-only)
// and control returns to the best one after `recovery_checks` good checks in a row.
//
// With `SyncMethod::FrameNumber`, lookups that carry a frame number match the
// sample tagged with it; plain timestamp lookups always use the time window.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{SyncConfig, SyncMethod};
use crate::error::{GeolocError, GeolocResult};
use crate::sources::PoseSource;
use crate::types::PoseSample;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FailoverState {
    PrimaryActive,
    Degraded { source: usize },
    AllFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub lookups: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub avg_time_diff_ms: f64,
    pub failovers: u64,
    pub recoveries: u64,
    pub per_source_matches: BTreeMap<String, u64>,
}

struct RankedSource {
    priority: u32,
    source: Arc<dyn PoseSource>,
}

pub struct PoseSynchronizer {
    sources: Vec<RankedSource>,
    config: SyncConfig,
    state: FailoverState,
    consecutive_failures: u32,
    lookups_since_recheck: u32,
    recheck_target: Option<usize>,
    recheck_streak: u32,
    total_time_diff_ms: f64,
    time_matched: u64,
    stats: SyncStats,
}

/// Linear blend of two samples at `timestamp_ms`; yaw follows the shortest arc.
pub fn interpolate(a: &PoseSample, b: &PoseSample, timestamp_ms: i64) -> PoseSample {
    let span = (b.timestamp_ms - a.timestamp_ms) as f64;
    if span <= 0.0 {
        return PoseSample {
            timestamp_ms,
            ..a.clone()
        };
    }
    let f = ((timestamp_ms - a.timestamp_ms) as f64 / span).clamp(0.0, 1.0);
    let lerp = |x: f64, y: f64| x + (y - x) * f;
    let lerp_opt = |x: Option<f64>, y: Option<f64>| match (x, y) {
        (Some(x), Some(y)) => Some(lerp(x, y)),
        (x, y) => {
            if f < 0.5 {
                x
            } else {
                y
            }
        }
    };

    let yaw_delta = (b.yaw_deg - a.yaw_deg + 540.0).rem_euclid(360.0) - 180.0;
    let nearer = if f <= 0.5 { a } else { b };

    PoseSample {
        timestamp_ms,
        lat: lerp(a.lat, b.lat),
        lon: lerp(a.lon, b.lon),
        altitude_m: lerp(a.altitude_m, b.altitude_m),
        yaw_deg: (a.yaw_deg + yaw_delta * f).rem_euclid(360.0),
        pitch_deg: lerp(a.pitch_deg, b.pitch_deg),
        roll_deg: lerp(a.roll_deg, b.roll_deg),
        gimbal_yaw: lerp_opt(a.gimbal_yaw, b.gimbal_yaw),
        gimbal_pitch: lerp_opt(a.gimbal_pitch, b.gimbal_pitch),
        gimbal_roll: lerp_opt(a.gimbal_roll, b.gimbal_roll),
        ..nearer.clone()
    }
}

impl PoseSynchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            sources: Vec::new(),
            config,
            state: FailoverState::PrimaryActive,
            consecutive_failures: 0,
            lookups_since_recheck: 0,
            recheck_target: None,
            recheck_streak: 0,
            total_time_diff_ms: 0.0,
            time_matched: 0,
            stats: SyncStats::default(),
        }
    }

    /// Register a source. Lower `priority` values are preferred; equal
    /// priorities keep registration order.
    pub fn add_source(&mut self, source: Arc<dyn PoseSource>, priority: u32) {
        log::info!("Pose source '{}' ({}) registered at priority {}", source.name(), source.kind(), priority);
        let idx = self.sources.partition_point(|s| s.priority <= priority);
        self.sources.insert(idx, RankedSource { priority, source });
    }

    pub fn with_source(mut self, source: Arc<dyn PoseSource>, priority: u32) -> Self {
        self.add_source(source, priority);
        self
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    fn active_index(&self) -> Option<usize> {
        match self.state {
            FailoverState::PrimaryActive => Some(0),
            FailoverState::Degraded { source } => Some(source),
            FailoverState::AllFailed => None,
        }
    }

    pub fn active_source(&self) -> Option<&str> {
        self.active_index()
            .and_then(|i| self.sources.get(i))
            .map(|s| s.source.name())
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.clone();
        if self.time_matched > 0 {
            stats.avg_time_diff_ms = self.total_time_diff_ms / self.time_matched as f64;
        }
        stats
    }

    fn state_for(index: usize) -> FailoverState {
        if index == 0 {
            FailoverState::PrimaryActive
        } else {
            FailoverState::Degraded { source: index }
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.lookups_since_recheck = 0;
        self.recheck_target = None;
        self.recheck_streak = 0;
    }

    /// Move to the next source in priority order, or to `AllFailed`.
    fn fail_over(&mut self, from: usize, reason: &str) {
        let next = from + 1;
        let from_name = self.sources[from].source.name().to_string();
        if next < self.sources.len() {
            self.state = Self::state_for(next);
            self.stats.failovers += 1;
            log::warn!(
                "Pose source '{}' {}; failing over to '{}'",
                from_name,
                reason,
                self.sources[next].source.name()
            );
        } else {
            self.state = FailoverState::AllFailed;
            log::error!("Pose source '{}' {}; all pose sources failed", from_name, reason);
        }
        self.reset_counters();
    }

    /// Frame number to match on, if frame matching is configured.
    fn frame_key(&self, frame_number: Option<u64>) -> Option<u64> {
        frame_number.filter(|_| self.config.method == SyncMethod::FrameNumber)
    }

    /// Re-check sources ranked above the active one; switch after enough good checks in a row.
    fn recheck(&mut self, frame: Option<u64>, timestamp_ms: i64) {
        self.lookups_since_recheck += 1;
        if self.lookups_since_recheck < self.config.recheck_interval {
            return;
        }
        self.lookups_since_recheck = 0;

        let limit = self.active_index().unwrap_or(self.sources.len());
        let healthy = self.sources[..limit]
            .iter()
            .position(|s| s.source.is_available() && self.lookup(s.source.as_ref(), frame, timestamp_ms).is_some());

        match healthy {
            Some(idx) => {
                if self.recheck_target == Some(idx) {
                    self.recheck_streak += 1;
                } else {
                    self.recheck_target = Some(idx);
                    self.recheck_streak = 1;
                }
                if self.recheck_streak >= self.config.recovery_checks {
                    log::info!(
                        "Pose source '{}' healthy for {} checks; switching back",
                        self.sources[idx].source.name(),
                        self.recheck_streak
                    );
                    self.state = Self::state_for(idx);
                    self.stats.recoveries += 1;
                    self.reset_counters();
                }
            }
            None => {
                self.recheck_target = None;
                self.recheck_streak = 0;
            }
        }
    }

    fn lookup(&self, source: &dyn PoseSource, frame: Option<u64>, timestamp_ms: i64) -> Option<PoseSample> {
        if let Some(frame_number) = frame {
            return source.by_frame(frame_number);
        }
        let tolerance = self.config.timestamp_tolerance_ms;
        let nearest = source.nearest(timestamp_ms, tolerance)?;
        if !self.config.interpolate || nearest.timestamp_ms == timestamp_ms {
            return Some(nearest);
        }
        // Only blend across a gap the tolerance could have matched from both sides
        match source.buffer().bracket(timestamp_ms) {
            Some((before, after)) if after.timestamp_ms - before.timestamp_ms <= 2 * tolerance => {
                Some(interpolate(&before, &after, timestamp_ms))
            }
            _ => Some(nearest),
        }
    }

    /// Pose for a frame timestamp from the active source.
    pub fn get_pose(&mut self, timestamp_ms: i64) -> GeolocResult<PoseSample> {
        self.resolve(None, timestamp_ms)
    }

    /// Pose for a numbered frame. Matches by frame number under
    /// `SyncMethod::FrameNumber`, by timestamp otherwise.
    pub fn get_pose_for_frame(&mut self, frame_number: u64, timestamp_ms: i64) -> GeolocResult<PoseSample> {
        let frame = self.frame_key(Some(frame_number));
        self.resolve(frame, timestamp_ms)
    }

    fn resolve(&mut self, frame: Option<u64>, timestamp_ms: i64) -> GeolocResult<PoseSample> {
        self.stats.lookups += 1;
        if self.sources.is_empty() {
            self.stats.unmatched += 1;
            return Err(GeolocError::AllSourcesFailed { timestamp_ms });
        }

        if self.state != FailoverState::PrimaryActive {
            self.recheck(frame, timestamp_ms);
        }

        // Unavailable transports are skipped without waiting for K misses
        while let Some(active) = self.active_index() {
            if self.sources[active].source.is_available() {
                break;
            }
            self.fail_over(active, "is unavailable");
        }

        let Some(active) = self.active_index() else {
            self.stats.unmatched += 1;
            return Err(GeolocError::AllSourcesFailed { timestamp_ms });
        };

        let source = Arc::clone(&self.sources[active].source);
        match self.lookup(source.as_ref(), frame, timestamp_ms) {
            Some(pose) => {
                self.consecutive_failures = 0;
                self.stats.matched += 1;
                *self.stats.per_source_matches.entry(source.name().to_string()).or_insert(0) += 1;
                match frame {
                    // Log time and video time may disagree; the offset says nothing here
                    Some(_) => {
                        if self.config.evict_consumed {
                            source.buffer().evict_before(pose.timestamp_ms);
                        }
                    }
                    None => {
                        self.time_matched += 1;
                        self.total_time_diff_ms += (pose.timestamp_ms - timestamp_ms).abs() as f64;
                        if self.config.evict_consumed {
                            source.buffer().evict_before(timestamp_ms - self.config.timestamp_tolerance_ms);
                        }
                    }
                }
                Ok(pose)
            }
            None => {
                self.consecutive_failures += 1;
                self.stats.unmatched += 1;
                log::debug!(
                    "No pose from '{}' for frame {:?} at {} ms ({} misses in a row)",
                    source.name(),
                    frame,
                    timestamp_ms,
                    self.consecutive_failures
                );
                if self.consecutive_failures >= self.config.consecutive_failure_threshold {
                    let reason = format!("missed {} lookups in a row", self.consecutive_failures);
                    self.fail_over(active, &reason);
                }
                Err(match frame {
                    Some(frame_number) => GeolocError::MissingFramePose { frame_number },
                    None => GeolocError::MissingPose {
                        timestamp_ms,
                        tolerance_ms: self.config.timestamp_tolerance_ms,
                    },
                })
            }
        }
    }
}
