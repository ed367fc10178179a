pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::error::{GeolocError, GeolocResult};

/// Which kind of telemetry transport produced a pose sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Recorded flight log (subtitle track, replay file)
    Log,
    /// Push-subscribe feed
    Push,
    /// Poll-based feed
    Poll,
    /// Telemetry read off the burned-in on-screen overlay
    Ocr,
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SourceKind::Log => write!(f, "log"),
            SourceKind::Push => write!(f, "push"),
            SourceKind::Poll => write!(f, "poll"),
            SourceKind::Ocr => write!(f, "ocr"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub timestamp_ms: i64,
    /// Video frame the sample belongs to, when the log records it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u64>,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub yaw_deg: f64,
    pub pitch_deg: f64,
    pub roll_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gimbal_yaw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gimbal_pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gimbal_roll: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellite_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positioning_state: Option<String>,
    pub source_tag: String,
    pub source_kind: SourceKind,
}

impl PoseSample {
    /// Minimal pose with no quality or gimbal fields.
    pub fn new(
        timestamp_ms: i64,
        lat: f64,
        lon: f64,
        altitude_m: f64,
        yaw_deg: f64,
        pitch_deg: f64,
        roll_deg: f64,
    ) -> Self {
        Self {
            timestamp_ms,
            frame_number: None,
            lat,
            lon,
            altitude_m,
            yaw_deg,
            pitch_deg,
            roll_deg,
            gimbal_yaw: None,
            gimbal_pitch: None,
            gimbal_roll: None,
            gps_level: None,
            satellite_count: None,
            positioning_state: None,
            source_tag: "unknown".to_string(),
            source_kind: SourceKind::Log,
        }
    }

    pub fn with_source(mut self, tag: &str, kind: SourceKind) -> Self {
        self.source_tag = tag.to_string();
        self.source_kind = kind;
        self
    }

    pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn with_gimbal(mut self, yaw: Option<f64>, pitch: Option<f64>, roll: Option<f64>) -> Self {
        self.gimbal_yaw = yaw;
        self.gimbal_pitch = pitch;
        self.gimbal_roll = roll;
        self
    }

    pub fn with_quality(
        mut self,
        gps_level: Option<u8>,
        satellite_count: Option<u32>,
        positioning_state: Option<&str>,
    ) -> Self {
        self.gps_level = gps_level;
        self.satellite_count = satellite_count;
        self.positioning_state = positioning_state.map(str::to_string);
        self
    }

    pub fn has_gimbal(&self) -> bool {
        self.gimbal_yaw.is_some() || self.gimbal_pitch.is_some() || self.gimbal_roll.is_some()
    }

    /// Rejects samples no transport should have produced: non-finite fields,
    /// out-of-range coordinates, or the (0, 0) "no fix" placeholder.
    pub fn validate(&self) -> GeolocResult<()> {
        let required = [
            self.lat,
            self.lon,
            self.altitude_m,
            self.yaw_deg,
            self.pitch_deg,
            self.roll_deg,
        ];
        if required.iter().any(|v| !v.is_finite()) {
            return Err(GeolocError::Parse(format!(
                "pose at {} ms has non-finite fields",
                self.timestamp_ms
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lon) {
            return Err(GeolocError::Parse(format!(
                "pose at {} ms out of range: ({}, {})",
                self.timestamp_ms, self.lat, self.lon
            )));
        }
        if self.lat == 0.0 && self.lon == 0.0 {
            return Err(GeolocError::Parse(format!(
                "pose at {} ms has no GPS fix (0, 0)",
                self.timestamp_ms
            )));
        }
        Ok(())
    }
}

/// Pixel-space bounding box, either axis-aligned or as four corners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PixelBox {
    Rect { x1: f64, y1: f64, x2: f64, y2: f64 },
    Corners([[f64; 2]; 4]),
}

impl PixelBox {
    /// Corners in order top-left, top-right, bottom-right, bottom-left for rectangles;
    /// as given for explicit quadrilaterals.
    pub fn corners(&self) -> [(f64, f64); 4] {
        match self {
            PixelBox::Rect { x1, y1, x2, y2 } => {
                let (left, right) = (x1.min(*x2), x1.max(*x2));
                let (top, bottom) = (y1.min(*y2), y1.max(*y2));
                [(left, top), (right, top), (right, bottom), (left, bottom)]
            }
            PixelBox::Corners(pts) => [
                (pts[0][0], pts[0][1]),
                (pts[1][0], pts[1][1]),
                (pts[2][0], pts[2][1]),
                (pts[3][0], pts[3][1]),
            ],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub frame_number: u64,
    #[serde(default)]
    pub frame_timestamp_ms: i64,
    pub bbox: PixelBox,
    pub class_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub confidence: f64,
}

impl Detection {
    pub fn new(frame_number: u64, frame_timestamp_ms: i64, bbox: PixelBox, class_id: u32, confidence: f64) -> Self {
        Self {
            frame_number,
            frame_timestamp_ms,
            bbox,
            class_id,
            class_name: None,
            confidence,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GpsQuality {
    Rtk,
    High,
    Medium,
    Low,
    Invalid,
}

impl GpsQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpsQuality::Rtk => "RTK",
            GpsQuality::High => "HIGH",
            GpsQuality::Medium => "MEDIUM",
            GpsQuality::Low => "LOW",
            GpsQuality::Invalid => "INVALID",
        }
    }
}

impl Display for GpsQuality {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Image border a detection touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeSide {
    Left,
    Right,
    Top,
    Bottom,
}

/// Geolocated detection, the core output record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoDetection {
    pub class_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub confidence: f64,
    pub corner_lat: [f64; 4],
    pub corner_lon: [f64; 4],
    pub center_lat: f64,
    pub center_lon: f64,
    pub drone_lat: f64,
    pub drone_lon: f64,
    pub altitude_m: f64,
    pub gps_quality: GpsQuality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positioning_state: Option<String>,
    pub estimated_error_m: f64,
    pub is_on_edge: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edge_sides: Vec<EdgeSide>,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub pose_source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}
