//! On-screen overlay telemetry
//!
//! Fallback for footage with no structured telemetry channel. The OCR engine
//! is external; it hands recognised overlay text to [`OsdTextSource::ingest_text`].
//! Accepted position forms: `latitude: 22.78`, `22.78°N`, `N 22.78`.

use regex::Regex;
use std::sync::Mutex;

use super::{PoseBuffer, PoseSource, DEFAULT_BUFFER_CAPACITY};
use crate::error::{GeolocError, GeolocResult};
use crate::types::{PoseSample, SourceKind};

struct OsdPatterns {
    latitude: Vec<Regex>,
    longitude: Vec<Regex>,
    altitude: Vec<Regex>,
    yaw: Regex,
    pitch: Regex,
    roll: Regex,
}

fn compile(patterns: &[&str]) -> GeolocResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| GeolocError::Parse(e.to_string())))
        .collect()
}

fn first_match(patterns: &[Regex], text: &str) -> Option<f64> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

impl OsdPatterns {
    fn new() -> GeolocResult<Self> {
        let single = |p: &str| Regex::new(p).map_err(|e| GeolocError::Parse(e.to_string()));
        Ok(Self {
            latitude: compile(&[
                r"(?i)latitude[:\s]*([+-]?\d+\.\d+)",
                r"([+-]?\d+\.\d+)°?[Nn]\b",
                r"\b[Nn][:\s]*([+-]?\d+\.\d+)",
                r"纬度[:\s]*([+-]?\d+\.\d+)",
            ])?,
            longitude: compile(&[
                r"(?i)longitude[:\s]*([+-]?\d+\.\d+)",
                r"([+-]?\d+\.\d+)°?[Ee]\b",
                r"\b[Ee][:\s]*([+-]?\d+\.\d+)",
                r"经度[:\s]*([+-]?\d+\.\d+)",
            ])?,
            altitude: compile(&[
                r"(?i)altitude[:\s]*([+-]?\d+(?:\.\d+)?)",
                r"\bH[:\s]*([+-]?\d+(?:\.\d+)?)",
                r"高度[:\s]*([+-]?\d+(?:\.\d+)?)",
                r"\d°?\s*[Ee]\s+([+-]?\d+(?:\.\d+)?)\s*[mM]?",
                r"([+-]?\d+(?:\.\d+)?)\s*[mM]\s*$",
            ])?,
            yaw: single(r"(?i)\byaw[:\s]*([+-]?\d+(?:\.\d+)?)")?,
            pitch: single(r"(?i)\bpitch[:\s]*([+-]?\d+(?:\.\d+)?)")?,
            roll: single(r"(?i)\broll[:\s]*([+-]?\d+(?:\.\d+)?)")?,
        })
    }
}

pub struct OsdTextSource {
    name: String,
    patterns: OsdPatterns,
    buffer: PoseBuffer,
    reuse_last: bool,
    last: Mutex<Option<PoseSample>>,
}

impl OsdTextSource {
    pub fn new(name: &str, reuse_last: bool) -> GeolocResult<Self> {
        Ok(Self {
            name: name.to_string(),
            patterns: OsdPatterns::new()?,
            buffer: PoseBuffer::bounded(DEFAULT_BUFFER_CAPACITY),
            reuse_last,
            last: Mutex::new(None),
        })
    }

    /// Parse overlay text without buffering it.
    pub fn parse_text(&self, timestamp_ms: i64, text: &str) -> GeolocResult<PoseSample> {
        let p = &self.patterns;
        let text = text.trim();
        let (lat, lon) = match (first_match(&p.latitude, text), first_match(&p.longitude, text)) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err(GeolocError::Parse(format!(
                    "no position in overlay text '{}'",
                    text.chars().take(80).collect::<String>()
                )))
            }
        };
        let one = |re: &Regex| first_match(std::slice::from_ref(re), text);

        let sample = PoseSample::new(
            timestamp_ms,
            lat,
            lon,
            first_match(&p.altitude, text).unwrap_or(0.0),
            one(&p.yaw).unwrap_or(0.0),
            one(&p.pitch).unwrap_or(-90.0),
            one(&p.roll).unwrap_or(0.0),
        )
        .with_source(&self.name, SourceKind::Ocr);
        sample.validate()?;
        Ok(sample)
    }

    /// Parse and buffer one OCR result. When parsing fails and reuse is on,
    /// the last good pose is re-stamped to this frame instead.
    pub fn ingest_text(&self, timestamp_ms: i64, text: &str) -> GeolocResult<PoseSample> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let sample = match self.parse_text(timestamp_ms, text) {
            Ok(sample) => {
                *last = Some(sample.clone());
                sample
            }
            Err(e) => match last.as_ref().filter(|_| self.reuse_last) {
                Some(prev) => {
                    log::debug!("[{}] {}; reusing pose from {} ms", self.name, e, prev.timestamp_ms);
                    PoseSample {
                        timestamp_ms,
                        ..prev.clone()
                    }
                }
                None => {
                    log::warn!("[{}] {}", self.name, e);
                    return Err(e);
                }
            },
        };
        self.buffer.push(sample.clone());
        Ok(sample)
    }
}

impl PoseSource for OsdTextSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Ocr
    }

    fn buffer(&self) -> &PoseBuffer {
        &self.buffer
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degree_suffix_overlay() {
        let osd = OsdTextSource::new("osd", false).unwrap();
        let pose = osd.parse_text(1000, "22.784800°N 114.105067°E 139.4m").unwrap();
        assert_eq!(pose.lat, 22.7848);
        assert_eq!(pose.lon, 114.105067);
        assert_eq!(pose.altitude_m, 139.4);
        assert_eq!(pose.pitch_deg, -90.0);
        assert_eq!(pose.source_kind, SourceKind::Ocr);
    }

    #[test]
    fn test_labelled_overlay() {
        let osd = OsdTextSource::new("osd", false).unwrap();
        let pose = osd
            .parse_text(0, "latitude: 31.123456 longitude: 120.654321 altitude: 88.5 yaw: 90.5 pitch: -10.2 roll: 5.3")
            .unwrap();
        assert_eq!(pose.lat, 31.123456);
        assert_eq!(pose.lon, 120.654321);
        assert_eq!(pose.altitude_m, 88.5);
        assert_eq!(pose.yaw_deg, 90.5);
        assert_eq!(pose.pitch_deg, -10.2);
        assert_eq!(pose.roll_deg, 5.3);
    }

    #[test]
    fn test_prefixed_overlay_with_height() {
        let osd = OsdTextSource::new("osd", false).unwrap();
        let pose = osd.parse_text(0, "N 22.5 E 113.9 H120").unwrap();
        assert_eq!(pose.lat, 22.5);
        assert_eq!(pose.lon, 113.9);
        assert_eq!(pose.altitude_m, 120.0);
    }

    #[test]
    fn test_reuse_last_pose_on_unreadable_frame() {
        let osd = OsdTextSource::new("osd", true).unwrap();
        assert!(osd.ingest_text(0, "smudge").is_err());

        osd.ingest_text(100, "22.78°N 114.1°E 100m").unwrap();
        let reused = osd.ingest_text(200, "smudge").unwrap();
        assert_eq!(reused.timestamp_ms, 200);
        assert_eq!(reused.lat, 22.78);
        assert_eq!(osd.buffer().len(), 2);

        let strict = OsdTextSource::new("osd", false).unwrap();
        strict.ingest_text(100, "22.78°N 114.1°E 100m").unwrap();
        assert!(strict.ingest_text(200, "smudge").is_err());
    }
}
