//! Push-subscribe aircraft state feed
//!
//! The broker connection is external; whatever receives a message hands the
//! raw payload to [`PushFeedSource::on_message`]. Field names vary between
//! firmware and bridge versions, so each value is looked up under a list of
//! aliases.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{PoseBuffer, PoseSource, DEFAULT_BUFFER_CAPACITY};
use crate::error::{GeolocError, GeolocResult};
use crate::types::{PoseSample, SourceKind};

const LAT_KEYS: &[&str] = &["latitude", "lat", "position_lat", "gps_lat"];
const LON_KEYS: &[&str] = &["longitude", "lon", "lng", "position_lon", "position_lng", "gps_lon", "gps_lng"];
const ALT_KEYS: &[&str] = &[
    "altitude",
    "altitude_above_sea_level",
    "altitudeAboveSeaLevel",
    "altitude_asl",
    "height",
    "relative_height",
    "relativeHeight",
    "elevation",
];
const YAW_KEYS: &[&str] = &["yaw", "attitude_head", "heading", "compass_heading"];
const PITCH_KEYS: &[&str] = &["pitch", "attitude_pitch"];
const ROLL_KEYS: &[&str] = &["roll", "attitude_roll"];
const GIMBAL_YAW_KEYS: &[&str] = &["gimbal_yaw", "gimbalYaw"];
const GIMBAL_PITCH_KEYS: &[&str] = &["gimbal_pitch", "gimbalPitch"];
const GIMBAL_ROLL_KEYS: &[&str] = &["gimbal_roll", "gimbalRoll"];
const GPS_LEVEL_KEYS: &[&str] = &["gps_level", "gpsLevel"];
const SATELLITE_KEYS: &[&str] = &["satellite_count", "satelliteCount", "gps_number"];
const POSITIONING_KEYS: &[&str] = &["positioning_state", "positioningState", "rtk_state"];

/// Camera straight down when the message carries no pitch.
const DEFAULT_PITCH_DEG: f64 = -90.0;

fn lookup<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| data.get(*k).filter(|v| !v.is_null()))
}

/// Numbers or numeric strings.
fn number(data: &Value, keys: &[&str]) -> Option<f64> {
    lookup(data, keys).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Parse one aircraft-state object into a pose sample.
///
/// `data` is the state object itself (already unwrapped from any envelope).
pub fn parse_state(data: &Value, timestamp_ms: i64, tag: &str, kind: SourceKind) -> GeolocResult<PoseSample> {
    if !data.is_object() {
        return Err(GeolocError::Parse("aircraft state is not a JSON object".into()));
    }
    let lat = number(data, LAT_KEYS).ok_or_else(|| GeolocError::Parse("state message has no latitude".into()))?;
    let lon = number(data, LON_KEYS).ok_or_else(|| GeolocError::Parse("state message has no longitude".into()))?;
    let altitude = number(data, ALT_KEYS).unwrap_or(0.0);
    if altitude == 0.0 {
        log::warn!("[{}] state message at {} ms has zero altitude", tag, timestamp_ms);
    }

    let sample = PoseSample::new(
        timestamp_ms,
        lat,
        lon,
        altitude,
        number(data, YAW_KEYS).unwrap_or(0.0),
        number(data, PITCH_KEYS).unwrap_or(DEFAULT_PITCH_DEG),
        number(data, ROLL_KEYS).unwrap_or(0.0),
    )
    .with_source(tag, kind)
    .with_gimbal(
        number(data, GIMBAL_YAW_KEYS),
        number(data, GIMBAL_PITCH_KEYS),
        number(data, GIMBAL_ROLL_KEYS),
    )
    .with_quality(
        number(data, GPS_LEVEL_KEYS).map(|v| v.clamp(0.0, u8::MAX as f64) as u8),
        number(data, SATELLITE_KEYS).map(|v| v.max(0.0) as u32),
        lookup(data, POSITIONING_KEYS).and_then(Value::as_str),
    );
    sample.validate()?;
    Ok(sample)
}

/// Message timestamp in ms, or wall clock when absent.
pub fn message_timestamp(payload: &Value) -> i64 {
    payload
        .get("timestamp")
        .and_then(Value::as_f64)
        .map(|t| t as i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

pub struct PushFeedSource {
    name: String,
    buffer: PoseBuffer,
    connected: AtomicBool,
    messages: AtomicU64,
    rejected: AtomicU64,
}

impl PushFeedSource {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            buffer: PoseBuffer::bounded(capacity),
            connected: AtomicBool::new(true),
            messages: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity(name: &str) -> Self {
        Self::new(name, DEFAULT_BUFFER_CAPACITY)
    }

    /// Handle one raw state message. The state may be wrapped in `data`.
    pub fn on_message(&self, payload: &str) -> GeolocResult<PoseSample> {
        let result = serde_json::from_str::<Value>(payload)
            .map_err(GeolocError::from)
            .and_then(|value| {
                let data = value.get("data").filter(|d| d.is_object()).unwrap_or(&value);
                parse_state(data, message_timestamp(&value), &self.name, SourceKind::Push)
            });

        match result {
            Ok(sample) => {
                self.messages.fetch_add(1, Ordering::Relaxed);
                self.buffer.push(sample.clone());
                log::debug!(
                    "[{}] pose ({:.6}, {:.6}) alt {:.1} m yaw {:.1}",
                    self.name,
                    sample.lat,
                    sample.lon,
                    sample.altitude_m,
                    sample.yaw_deg
                );
                Ok(sample)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] dropped state message: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Inject an already-parsed sample.
    pub fn push_sample(&self, sample: PoseSample) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.buffer.push(sample);
    }

    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::Relaxed) != connected {
            log::info!("[{}] {}", self.name, if connected { "connected" } else { "disconnected" });
        }
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl PoseSource for PushFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Push
    }

    fn buffer(&self) -> &PoseBuffer {
        &self.buffer
    }

    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_message_with_aliases() {
        let feed = PushFeedSource::with_default_capacity("push");
        let msg = r#"{
            "timestamp": 1700000000123,
            "data": {
                "lat": 22.78, "lng": "114.1", "altitude_above_sea_level": 120.5,
                "attitude_head": 45.0, "attitude_pitch": -30.0, "attitude_roll": 1.5,
                "gimbalPitch": -90.0, "gps_level": 5, "satelliteCount": 21,
                "positioning_state": "RTK_FIXED"
            }
        }"#;

        let pose = feed.on_message(msg).unwrap();
        assert_eq!(pose.timestamp_ms, 1_700_000_000_123);
        assert_eq!(pose.lon, 114.1);
        assert_eq!(pose.altitude_m, 120.5);
        assert_eq!(pose.yaw_deg, 45.0);
        assert_eq!(pose.pitch_deg, -30.0);
        assert_eq!(pose.gimbal_pitch, Some(-90.0));
        assert_eq!(pose.gps_level, Some(5));
        assert_eq!(pose.satellite_count, Some(21));
        assert_eq!(pose.positioning_state.as_deref(), Some("RTK_FIXED"));
        assert_eq!(pose.source_kind, SourceKind::Push);
        assert_eq!(feed.buffer().len(), 1);
    }

    #[test]
    fn test_missing_pitch_defaults_to_nadir() {
        let feed = PushFeedSource::with_default_capacity("push");
        let pose = feed
            .on_message(r#"{"timestamp": 5, "latitude": 22.78, "longitude": 114.1, "height": 80}"#)
            .unwrap();
        assert_eq!(pose.pitch_deg, -90.0);
        assert_eq!(pose.roll_deg, 0.0);
        assert!(pose.gps_level.is_none());
        assert!(!pose.has_gimbal());
    }

    #[test]
    fn test_bad_messages_are_rejected_not_buffered() {
        let feed = PushFeedSource::with_default_capacity("push");
        assert!(feed.on_message("not json").is_err());
        assert!(feed.on_message(r#"{"data": {"longitude": 114.1}}"#).is_err());
        assert!(feed.on_message(r#"{"latitude": 0, "longitude": 0, "altitude": 50}"#).is_err());
        assert_eq!(feed.rejected_count(), 3);
        assert!(feed.buffer().is_empty());
    }

    #[test]
    fn test_disconnect_marks_unavailable() {
        let feed = PushFeedSource::with_default_capacity("push");
        assert!(feed.is_available());
        feed.set_connected(false);
        assert!(!feed.is_available());
    }
}
