use thiserror::Error;

use crate::types::GpsQuality;

/// Geolocation error types
///
/// Everything except `InvalidConfig` is recoverable at detection or frame
/// granularity; the pipeline logs and drops, it never aborts.
#[derive(Error, Debug)]
pub enum GeolocError {
    #[error("corner {corner} ray does not reach the ground plane (up component {up:.4})")]
    Geometry { corner: usize, up: f64 },

    #[error("aircraft height above ground is {height_m:.2} m")]
    BelowGround { height_m: f64 },

    #[error("no pose within {tolerance_ms} ms of frame time {timestamp_ms}")]
    MissingPose { timestamp_ms: i64, tolerance_ms: i64 },

    #[error("no pose tagged with frame {frame_number}")]
    MissingFramePose { frame_number: u64 },

    #[error("GPS quality {quality} rejected by policy")]
    LowGpsQuality { quality: GpsQuality },

    #[error("pose source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("all pose sources failed at frame time {timestamp_ms}")]
    AllSourcesFailed { timestamp_ms: i64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GeolocError {
    /// True for failures that only cost the current detection or frame.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GeolocError::InvalidConfig(_))
    }
}

pub type GeolocResult<T> = Result<T, GeolocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_fatal() {
        assert!(!GeolocError::InvalidConfig("focal length".into()).is_recoverable());
        assert!(GeolocError::Geometry { corner: 2, up: 0.01 }.is_recoverable());
        assert!(GeolocError::AllSourcesFailed { timestamp_ms: 10 }.is_recoverable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = GeolocError::MissingPose { timestamp_ms: 1500, tolerance_ms: 100 };
        let msg = err.to_string();
        assert!(msg.contains("1500"));
        assert!(msg.contains("100 ms"));

        let err = GeolocError::LowGpsQuality { quality: GpsQuality::Invalid };
        assert!(err.to_string().contains("INVALID"));
    }
}
