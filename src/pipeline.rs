// pipeline.rs: detections + pose → geolocated records
//
// Data flow per frame:
//   FrameQueue ─▶ Detector ─▶ PoseSynchronizer ─▶ quality gate ─▶ GeoDetectionBuilder
//                                                                     │
//                                          raw records ◀──────────────┘
//
// Nothing here aborts a run. Pose, quality and geometry failures drop the
// frame or the single detection, get logged and counted, and processing goes on.

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::builder::GeoDetectionBuilder;
use crate::config::GeolocConfig;
use crate::dedup::{DedupStats, Deduplicator, WindowedDeduplicator};
use crate::error::{GeolocError, GeolocResult};
use crate::export::Exporter;
use crate::sync::{PoseSynchronizer, SyncStats};
use crate::types::{Detection, GeoDetection, GpsQuality};

/// One decoded frame. The image type belongs to the decoder.
#[derive(Clone, Debug)]
pub struct VideoFrame<P> {
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub image: P,
}

/// External object detector.
pub trait Detector<P> {
    fn detect(&mut self, frame: &VideoFrame<P>) -> GeolocResult<Vec<Detection>>;
}

/// Bounded frame queue that drops the oldest frame when full.
pub struct FrameQueue<T> {
    inner: ArrayQueue<T>,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue; returns the evicted oldest item when the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = self.inner.force_push(item);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Why a whole frame produced nothing.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSkip {
    MissingPose,
    AllSourcesFailed,
    LowGpsQuality(GpsQuality),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FrameOutcome {
    pub frame_number: u64,
    pub detections: usize,
    pub geolocated: usize,
    pub geometry_failures: usize,
    pub skipped: Option<FrameSkip>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_dropped_from_queue: u64,
    pub frames_without_pose: u64,
    pub frames_skipped_quality: u64,
    pub detector_errors: u64,
    pub detections_in: u64,
    pub geolocated: u64,
    pub geometry_failures: u64,
    pub elapsed_secs: f64,
}

/// Everything a run produced, ready for export.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunOutput {
    pub generated_at: String,
    /// Every record built, before scoring and grouping
    pub raw: Vec<GeoDetection>,
    pub deduplicated: Vec<GeoDetection>,
    pub sync_stats: SyncStats,
    pub dedup_stats: DedupStats,
    pub pipeline_stats: PipelineStats,
}

pub struct GeoPipeline {
    config: GeolocConfig,
    builder: GeoDetectionBuilder,
    sync: PoseSynchronizer,
    windowed: Option<WindowedDeduplicator>,
    streamed: Vec<GeoDetection>,
    raw: Vec<GeoDetection>,
    stats: PipelineStats,
    started: Instant,
}

impl GeoPipeline {
    /// Validates the configuration; this is the only fatal check of a run.
    pub fn new(config: GeolocConfig, sync: PoseSynchronizer) -> GeolocResult<Self> {
        config.validate()?;
        let builder = GeoDetectionBuilder::from_config(&config)?;
        let windowed = config
            .pipeline
            .streaming_dedup
            .then(|| WindowedDeduplicator::new(config.dedup.clone()));
        Ok(Self {
            config,
            builder,
            sync,
            windowed,
            streamed: Vec::new(),
            raw: Vec::new(),
            stats: PipelineStats::default(),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &GeolocConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &PoseSynchronizer {
        &self.sync
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn raw_records(&self) -> &[GeoDetection] {
        &self.raw
    }

    /// Records already emitted by streaming deduplication.
    pub fn streamed_records(&self) -> &[GeoDetection] {
        &self.streamed
    }

    pub fn process_frame(&mut self, frame_number: u64, timestamp_ms: i64, detections: &[Detection]) -> FrameOutcome {
        self.stats.frames_processed += 1;
        self.stats.detections_in += detections.len() as u64;

        let mut outcome = FrameOutcome {
            frame_number,
            detections: detections.len(),
            geolocated: 0,
            geometry_failures: 0,
            skipped: None,
        };
        if detections.is_empty() {
            return outcome;
        }

        let pose = match self.sync.get_pose_for_frame(frame_number, timestamp_ms) {
            Ok(pose) => pose,
            Err(e) => {
                self.stats.frames_without_pose += 1;
                outcome.skipped = Some(match e {
                    GeolocError::AllSourcesFailed { .. } => FrameSkip::AllSourcesFailed,
                    _ => FrameSkip::MissingPose,
                });
                log::warn!("Frame {}: {} detections dropped: {}", frame_number, detections.len(), e);
                return outcome;
            }
        };

        let assessment = match self.builder.assess(&pose) {
            Ok(a) => a,
            Err(e) => {
                self.stats.frames_skipped_quality += 1;
                if let GeolocError::LowGpsQuality { quality } = e {
                    outcome.skipped = Some(FrameSkip::LowGpsQuality(quality));
                }
                log::warn!("Frame {}: {} detections dropped: {}", frame_number, detections.len(), e);
                return outcome;
            }
        };

        for detection in detections {
            let mut detection = detection.clone();
            detection.frame_number = frame_number;
            detection.frame_timestamp_ms = timestamp_ms;

            match self.builder.build_assessed(&detection, &pose, &assessment) {
                Ok(record) => {
                    outcome.geolocated += 1;
                    self.accept(record);
                }
                Err(e) => {
                    outcome.geometry_failures += 1;
                    match e {
                        GeolocError::Geometry { corner, .. } => {
                            log::warn!("Frame {}: detection dropped at corner {}: {}", frame_number, corner, e)
                        }
                        _ => log::warn!("Frame {}: detection dropped: {}", frame_number, e),
                    }
                }
            }
        }

        self.stats.geolocated += outcome.geolocated as u64;
        self.stats.geometry_failures += outcome.geometry_failures as u64;
        log::debug!(
            "Frame {} @ {} ms: {}/{} geolocated",
            frame_number,
            timestamp_ms,
            outcome.geolocated,
            outcome.detections
        );
        outcome
    }

    fn accept(&mut self, record: GeoDetection) {
        if let Some(windowed) = self.windowed.as_mut() {
            if let Some(batch) = windowed.push(record.clone()) {
                self.streamed.extend(batch);
            }
        }
        self.raw.push(record);
    }

    /// Pop and process frames until `stop` is set and the queue is empty.
    ///
    /// Frames queued before the stop request are still processed.
    pub fn run_until_stopped<P, D>(&mut self, queue: &FrameQueue<VideoFrame<P>>, detector: &mut D, stop: &AtomicBool) -> u64
    where
        D: Detector<P>,
    {
        let idle = Duration::from_millis(self.config.pipeline.idle_sleep_ms);
        let mut processed = 0;

        loop {
            match queue.pop() {
                Some(frame) => {
                    processed += 1;
                    match detector.detect(&frame) {
                        Ok(detections) => {
                            self.process_frame(frame.frame_number, frame.timestamp_ms, &detections);
                        }
                        Err(e) => {
                            self.stats.detector_errors += 1;
                            log::warn!("Frame {}: detector failed: {}", frame.frame_number, e);
                        }
                    }
                }
                None => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(idle);
                }
            }
        }

        self.stats.frames_dropped_from_queue = queue.dropped();
        log::info!(
            "Frame worker stopped: {} frames processed, {} dropped from queue",
            processed,
            queue.dropped()
        );
        processed
    }

    /// Flush, deduplicate and hand back everything the run produced.
    pub fn finish(mut self) -> RunOutput {
        self.stats.elapsed_secs = self.started.elapsed().as_secs_f64();

        let (deduplicated, dedup_stats) = match self.windowed.take() {
            Some(mut windowed) => {
                let mut emitted = std::mem::take(&mut self.streamed);
                emitted.extend(windowed.finish());
                windowed.consolidate(&emitted)
            }
            None => Deduplicator::new(self.config.dedup.clone()).deduplicate_with_stats(&self.raw),
        };

        let output = RunOutput {
            generated_at: chrono::Utc::now().to_rfc3339(),
            raw: self.raw,
            deduplicated,
            sync_stats: self.sync.stats(),
            dedup_stats,
            pipeline_stats: self.stats,
        };
        log::info!(
            "Run finished: {} frames, {} raw records, {} after dedup ({:.1}s)",
            output.pipeline_stats.frames_processed,
            output.raw.len(),
            output.deduplicated.len(),
            output.pipeline_stats.elapsed_secs
        );
        output
    }

    /// `finish` followed by export.
    pub fn finish_and_export(self, exporter: &mut dyn Exporter) -> GeolocResult<RunOutput> {
        let output = self.finish();
        exporter.export(&output)?;
        Ok(output)
    }
}
