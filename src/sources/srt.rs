//! Subtitle-track flight log
//!
//! Each block is an index line, an `HH:MM:SS,mmm --> HH:MM:SS,mmm` time line
//! and free text carrying bracketed `key: value` telemetry. Block start time
//! is the sample timestamp, relative to the start of the video.

use flate2::read::GzDecoder;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::{PoseBuffer, PoseSource};
use crate::error::{GeolocError, GeolocResult};
use crate::types::{PoseSample, SourceKind};

const NUMBER: &str = r"([-+]?\d+(?:\.\d+)?)";

/// Compiled field patterns for subtitle blocks.
pub struct SrtParser {
    time_line: Regex,
    frame_count: Regex,
    latitude: Regex,
    longitude: Regex,
    rel_alt: Regex,
    altitude: Regex,
    abs_alt: Regex,
    yaw: Regex,
    pitch: Regex,
    roll: Regex,
    gimbal_yaw: Regex,
    gimbal_pitch: Regex,
    gimbal_roll: Regex,
}

fn field(key: &str) -> GeolocResult<Regex> {
    Regex::new(&format!(r"(?i)\b{}\s*:\s*{}", key, NUMBER)).map_err(|e| GeolocError::Parse(e.to_string()))
}

fn capture_f64(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl SrtParser {
    pub fn new() -> GeolocResult<Self> {
        Ok(Self {
            time_line: Regex::new(r"^(\d+):(\d{2}):(\d{2})[,.](\d{1,3})\s*-->")
                .map_err(|e| GeolocError::Parse(e.to_string()))?,
            frame_count: field("FrameCnt")?,
            latitude: field("latitude")?,
            longitude: field("longitude")?,
            rel_alt: field("rel_alt")?,
            altitude: field("altitude")?,
            abs_alt: field("abs_alt")?,
            yaw: field("yaw")?,
            pitch: field("pitch")?,
            roll: field("roll")?,
            gimbal_yaw: field("gb_yaw")?,
            gimbal_pitch: field("gb_pitch")?,
            gimbal_roll: field("gb_roll")?,
        })
    }

    /// Start of a block's time line, in ms.
    pub fn parse_time_line(&self, line: &str) -> Option<i64> {
        let caps = self.time_line.captures(line.trim())?;
        let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i64>().ok());
        let (h, m, s) = (part(1)?, part(2)?, part(3)?);
        // "5" after the comma means 500 ms
        let frac = caps.get(4)?.as_str();
        let ms = frac.parse::<i64>().ok()? * 10_i64.pow(3 - frac.len() as u32);
        Some((h * 3600 + m * 60 + s) * 1000 + ms)
    }

    /// Parse one block. `Ok(None)` for blocks with no position.
    pub fn parse_block(&self, block: &str, tag: &str) -> GeolocResult<Option<PoseSample>> {
        let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
        let index = lines.next().unwrap_or("");
        let time_line = lines.next().unwrap_or("");
        let body: Vec<&str> = lines.collect();
        if body.is_empty() {
            return Ok(None);
        }
        let text = body.join("\n");

        let timestamp_ms = self
            .parse_time_line(time_line)
            .ok_or_else(|| GeolocError::Parse(format!("block {}: bad time line '{}'", index, time_line)))?;

        let (lat, lon) = match (capture_f64(&self.latitude, &text), capture_f64(&self.longitude, &text)) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                log::warn!("SRT block {} has no GPS position, skipped", index);
                return Ok(None);
            }
        };

        let altitude = capture_f64(&self.rel_alt, &text)
            .or_else(|| capture_f64(&self.altitude, &text))
            .or_else(|| capture_f64(&self.abs_alt, &text))
            .unwrap_or(0.0);

        let sample = PoseSample::new(
            timestamp_ms,
            lat,
            lon,
            altitude,
            capture_f64(&self.yaw, &text).unwrap_or(0.0),
            capture_f64(&self.pitch, &text).unwrap_or(-90.0),
            capture_f64(&self.roll, &text).unwrap_or(0.0),
        )
        .with_source(tag, SourceKind::Log)
        .with_frame_number(
            capture_f64(&self.frame_count, &text)
                .filter(|f| *f >= 0.0)
                .map(|f| f as u64),
        )
        .with_gimbal(
            capture_f64(&self.gimbal_yaw, &text),
            capture_f64(&self.gimbal_pitch, &text),
            capture_f64(&self.gimbal_roll, &text),
        );
        Ok(Some(sample))
    }

    /// Parse a whole log. Malformed blocks are logged and skipped.
    pub fn parse(&self, content: &str, tag: &str) -> Vec<PoseSample> {
        let normalized = content.replace("\r\n", "\n");
        let mut samples = Vec::new();
        for block in normalized.split("\n\n").filter(|b| !b.trim().is_empty()) {
            match self.parse_block(block, tag) {
                Ok(Some(sample)) => match sample.validate() {
                    Ok(()) => samples.push(sample),
                    Err(e) => log::warn!("SRT sample rejected: {}", e),
                },
                Ok(None) => {}
                Err(e) => log::warn!("SRT block skipped: {}", e),
            }
        }
        samples
    }
}

/// Read a text file, transparently gunzipping `.gz` paths.
pub fn read_text<P: AsRef<Path>>(path: P) -> GeolocResult<String> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut text = String::new();
    if path.extension().map_or(false, |ext| ext == "gz") {
        GzDecoder::new(file).read_to_string(&mut text)?;
    } else {
        let mut file = file;
        file.read_to_string(&mut text)?;
    }
    Ok(text)
}

/// Pose source backed by a fully loaded subtitle log.
pub struct SrtLogSource {
    name: String,
    buffer: PoseBuffer,
}

impl SrtLogSource {
    pub fn from_str(name: &str, content: &str) -> GeolocResult<Self> {
        let parser = SrtParser::new()?;
        let buffer = PoseBuffer::unbounded();
        for sample in parser.parse(content, name) {
            buffer.push(sample);
        }
        Ok(Self {
            name: name.to_string(),
            buffer,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> GeolocResult<Self> {
        let path = path.as_ref();
        let source = Self::from_str("srt", &read_text(path)?)?;
        log::info!("Loaded {} poses from {}", source.buffer.len(), path.display());
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl PoseSource for SrtLogSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Log
    }

    fn buffer(&self) -> &PoseBuffer {
        &self.buffer
    }

    fn is_available(&self) -> bool {
        !self.buffer.is_empty()
    }
}
