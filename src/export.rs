//! Run output writers
//!
//! Final records go wherever an [`Exporter`] sends them. The file writer emits
//! one pretty-printed JSON document, gzipped when the path ends in `.gz`.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::GeolocResult;
use crate::pipeline::RunOutput;

/// Final-record consumer (file writer, database, uplink).
pub trait Exporter {
    fn export(&mut self, output: &RunOutput) -> GeolocResult<()>;
}

pub struct JsonExporter {
    path: PathBuf,
    include_raw: bool,
}

impl JsonExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            include_raw: true,
        }
    }

    /// Leave the pre-dedup records out of the document.
    pub fn without_raw(mut self) -> Self {
        self.include_raw = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_gzip(&self) -> bool {
        self.path.extension().map(|e| e == "gz").unwrap_or(false)
    }
}

impl Exporter for JsonExporter {
    fn export(&mut self, output: &RunOutput) -> GeolocResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let trimmed;
        let doc = if self.include_raw {
            output
        } else {
            trimmed = RunOutput {
                raw: Vec::new(),
                ..output.clone()
            };
            &trimmed
        };

        let file = File::create(&self.path)?;
        if self.is_gzip() {
            let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer_pretty(&mut gz, doc)?;
            gz.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, doc)?;
            writer.flush()?;
        }

        log::info!(
            "Wrote {} records ({} raw) to {}",
            doc.deduplicated.len(),
            doc.raw.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Collects outputs in memory.
#[derive(Default)]
pub struct MemoryExporter {
    pub outputs: Vec<RunOutput>,
}

impl Exporter for MemoryExporter {
    fn export(&mut self, output: &RunOutput) -> GeolocResult<()> {
        self.outputs.push(output.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupStats;
    use crate::pipeline::PipelineStats;
    use crate::sync::SyncStats;
    use crate::types::{GeoDetection, GpsQuality, SourceKind};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn record(frame: u64) -> GeoDetection {
        GeoDetection {
            class_id: 1,
            class_name: Some("vehicle".into()),
            confidence: 0.9,
            corner_lat: [22.78; 4],
            corner_lon: [114.1; 4],
            center_lat: 22.78,
            center_lon: 114.1,
            drone_lat: 22.78,
            drone_lon: 114.1,
            altitude_m: 100.0,
            gps_quality: GpsQuality::High,
            positioning_state: None,
            estimated_error_m: 3.0,
            is_on_edge: false,
            edge_sides: Vec::new(),
            frame_number: frame,
            timestamp_ms: frame as i64 * 33,
            pose_source: SourceKind::Log,
            quality_score: Some(0.9),
        }
    }

    fn output() -> RunOutput {
        RunOutput {
            generated_at: "2024-05-01T10:00:00+00:00".into(),
            raw: vec![record(0), record(1)],
            deduplicated: vec![record(1)],
            sync_stats: SyncStats::default(),
            dedup_stats: DedupStats::default(),
            pipeline_stats: PipelineStats::default(),
        }
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("geoloc_export_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_plain_json_document() {
        let dir = scratch("plain");
        let path = dir.join("run.json");
        JsonExporter::new(&path).export(&output()).unwrap();

        let back: RunOutput = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.raw.len(), 2);
        assert_eq!(back.deduplicated, vec![record(1)]);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_gz_suffix_compresses() {
        let dir = scratch("gz");
        let path = dir.join("run.json.gz");
        JsonExporter::new(&path).without_raw().export(&output()).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap()).read_to_string(&mut text).unwrap();
        let back: RunOutput = serde_json::from_str(&text).unwrap();
        assert!(back.raw.is_empty());
        assert_eq!(back.deduplicated.len(), 1);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_memory_exporter_collects() {
        let mut sink = MemoryExporter::default();
        sink.export(&output()).unwrap();
        assert_eq!(sink.outputs.len(), 1);
        assert_eq!(sink.outputs[0].generated_at, "2024-05-01T10:00:00+00:00");
    }
}
