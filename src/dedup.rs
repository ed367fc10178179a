// dedup.rs: Spatial deduplication of repeated sightings
//
// One object seen across dozens of consecutive frames collapses to the single
// best-scored record. Grouping is greedy in ascending (timestamp, frame) order:
// each record joins the open group whose seed is nearest (haversine, within the
// threshold), else seeds a new group. The pass repeats over its own output
// until nothing merges, so `deduplicate` is idempotent for every input.

use rstar::primitives::GeomWithData;
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::DedupConfig;
use crate::geodesy::haversine_m;
use crate::types::{GeoDetection, GpsQuality, SourceKind};

/// Lower bound on meters per degree used to size index queries, so the
/// degree-space search box always covers the haversine radius.
const INDEX_METERS_PER_DEGREE: f64 = 110_000.0;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub input: usize,
    pub filtered_out: usize,
    /// Groups found by the first grouping pass
    pub groups: usize,
    pub output: usize,
    pub passes: usize,
    pub removal_rate: f64,
}

pub fn gps_factor(quality: GpsQuality) -> f64 {
    match quality {
        GpsQuality::Rtk => 1.2,
        GpsQuality::High => 1.0,
        GpsQuality::Medium => 0.9,
        GpsQuality::Low => 0.7,
        GpsQuality::Invalid => 0.5,
    }
}

pub fn error_factor(estimated_error_m: f64) -> f64 {
    if estimated_error_m <= 5.0 {
        1.0
    } else if estimated_error_m <= 10.0 {
        0.9
    } else {
        0.8
    }
}

/// Nearest-seed lookup, linear or R-tree backed. Both return the same group.
enum SeedIndex {
    Linear(Vec<(f64, f64)>),
    Tree {
        tree: RTree<GeomWithData<[f64; 2], usize>>,
        seeds: Vec<(f64, f64)>,
    },
}

impl SeedIndex {
    fn new(use_tree: bool) -> Self {
        if use_tree {
            SeedIndex::Tree {
                tree: RTree::new(),
                seeds: Vec::new(),
            }
        } else {
            SeedIndex::Linear(Vec::new())
        }
    }

    fn insert(&mut self, lat: f64, lon: f64) -> usize {
        match self {
            SeedIndex::Linear(seeds) => {
                seeds.push((lat, lon));
                seeds.len() - 1
            }
            SeedIndex::Tree { tree, seeds } => {
                let group = seeds.len();
                seeds.push((lat, lon));
                tree.insert(GeomWithData::new([lon, lat], group));
                group
            }
        }
    }

    /// Nearest seed within `max_m`; equal distances resolve to the earliest group.
    fn nearest_within(&self, lat: f64, lon: f64, max_m: f64) -> Option<usize> {
        let mut best: Option<(f64, usize)> = None;
        let mut consider = |group: usize, seed: (f64, f64)| {
            let d = haversine_m(lat, lon, seed.0, seed.1);
            if d > max_m {
                return;
            }
            let better = match best {
                None => true,
                Some((best_d, best_g)) => d < best_d || (d == best_d && group < best_g),
            };
            if better {
                best = Some((d, group));
            }
        };

        match self {
            SeedIndex::Linear(seeds) => {
                for (group, &seed) in seeds.iter().enumerate() {
                    consider(group, seed);
                }
            }
            SeedIndex::Tree { tree, seeds } => {
                let pad_lat = 1.1 * max_m / INDEX_METERS_PER_DEGREE;
                let cos_lat = (lat.abs() + pad_lat).min(90.0).to_radians().cos();
                let pad_lon = if cos_lat > 1e-6 {
                    (1.1 * max_m / (INDEX_METERS_PER_DEGREE * cos_lat)).min(360.0)
                } else {
                    360.0
                };
                // Boxes crossing ±180° are also searched on the other side
                let shifts: &[f64] = if lon - pad_lon < -180.0 {
                    &[0.0, 360.0]
                } else if lon + pad_lon > 180.0 {
                    &[0.0, -360.0]
                } else {
                    &[0.0]
                };
                for shift in shifts {
                    let center = lon + shift;
                    let envelope =
                        AABB::from_corners([center - pad_lon, lat - pad_lat], [center + pad_lon, lat + pad_lat]);
                    for candidate in tree.locate_in_envelope(&envelope) {
                        let group = candidate.data;
                        consider(group, seeds[group]);
                    }
                }
            }
        }
        best.map(|(_, group)| group)
    }
}

fn by_time(a: &GeoDetection, b: &GeoDetection) -> Ordering {
    a.timestamp_ms
        .cmp(&b.timestamp_ms)
        .then(a.frame_number.cmp(&b.frame_number))
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// `confidence × edge × gps × error`. Overlay-derived poses use the
    /// dedicated OCR gps factor regardless of their label.
    pub fn quality_score(&self, record: &GeoDetection) -> f64 {
        let edge = if record.is_on_edge { self.config.edge_penalty } else { 1.0 };
        let gps = if record.pose_source == SourceKind::Ocr {
            self.config.ocr_gps_factor
        } else {
            gps_factor(record.gps_quality)
        };
        record.confidence * edge * gps * error_factor(record.estimated_error_m)
    }

    pub fn deduplicate(&self, records: &[GeoDetection]) -> Vec<GeoDetection> {
        self.deduplicate_with_stats(records).0
    }

    pub fn deduplicate_with_stats(&self, records: &[GeoDetection]) -> (Vec<GeoDetection>, DedupStats) {
        let mut stats = DedupStats {
            input: records.len(),
            ..Default::default()
        };

        let mut current: Vec<GeoDetection> = records
            .iter()
            .cloned()
            .map(|mut record| {
                record.quality_score = Some(self.quality_score(&record));
                record
            })
            .filter(|record| record.quality_score.unwrap_or(0.0) >= self.config.min_quality_score)
            .collect();
        stats.filtered_out = records.len() - current.len();

        if !self.config.enabled {
            current.sort_by(by_time);
            stats.groups = current.len();
            stats.output = current.len();
            stats.removal_rate = removal_rate(stats.input, stats.output);
            return (current, stats);
        }

        loop {
            let (next, groups) = self.group_pass(current.clone());
            stats.passes += 1;
            if stats.passes == 1 {
                stats.groups = groups;
            }
            if next.len() == current.len() {
                current = next;
                break;
            }
            current = next;
        }

        stats.output = current.len();
        stats.removal_rate = removal_rate(stats.input, stats.output);
        log::info!(
            "Dedup: {} -> {} records ({} below score, {} groups, {} passes, {:.1}% removed)",
            stats.input,
            stats.output,
            stats.filtered_out,
            stats.groups,
            stats.passes,
            stats.removal_rate * 100.0
        );
        (current, stats)
    }

    /// One greedy grouping pass; returns representatives in time order and the group count.
    fn group_pass(&self, mut records: Vec<GeoDetection>) -> (Vec<GeoDetection>, usize) {
        records.sort_by(by_time);

        let mut index = SeedIndex::new(self.config.use_spatial_index);
        // Per group: position of the current representative in `records`
        let mut best: Vec<usize> = Vec::new();

        for (pos, record) in records.iter().enumerate() {
            match index.nearest_within(record.center_lat, record.center_lon, self.config.distance_threshold_m) {
                Some(group) => {
                    let incumbent = &records[best[group]];
                    // Strictly greater: ties keep the earlier record
                    if record.quality_score.unwrap_or(0.0) > incumbent.quality_score.unwrap_or(0.0) {
                        best[group] = pos;
                    }
                }
                None => {
                    index.insert(record.center_lat, record.center_lon);
                    best.push(pos);
                }
            }
        }

        let groups = best.len();
        best.sort_unstable();
        let mut keep = best.into_iter().peekable();
        let representatives = records
            .into_iter()
            .enumerate()
            .filter_map(|(pos, record)| {
                if keep.peek() == Some(&pos) {
                    keep.next();
                    Some(record)
                } else {
                    None
                }
            })
            .collect();
        (representatives, groups)
    }
}

fn removal_rate(input: usize, output: usize) -> f64 {
    if input == 0 {
        0.0
    } else {
        (input - output) as f64 / input as f64
    }
}

/// Batch deduplication with default scoring parameters.
pub fn deduplicate(records: &[GeoDetection], distance_threshold_m: f64, min_quality_score: f64) -> Vec<GeoDetection> {
    let config = DedupConfig {
        distance_threshold_m,
        min_quality_score,
        ..DedupConfig::default()
    };
    Deduplicator::new(config).deduplicate(records)
}

/// Streaming deduplication over tumbling time windows.
///
/// Records are buffered until one arrives more than `window_ms` after the
/// window start; the buffered batch is then deduplicated and emitted, and the
/// new record opens the next window. A sighting that straddles a window
/// boundary survives once per window; [`WindowedDeduplicator::consolidate`]
/// merges the emitted batches into one idempotent set.
pub struct WindowedDeduplicator {
    dedup: Deduplicator,
    window_ms: i64,
    window_start: Option<i64>,
    buffer: Vec<GeoDetection>,
    stats: DedupStats,
}

impl WindowedDeduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let window_ms = config.window_ms;
        Self {
            dedup: Deduplicator::new(config),
            window_ms,
            window_start: None,
            buffer: Vec::new(),
            stats: DedupStats::default(),
        }
    }

    pub fn push(&mut self, record: GeoDetection) -> Option<Vec<GeoDetection>> {
        let ts = record.timestamp_ms;
        let flushed = match self.window_start {
            Some(start) if ts - start > self.window_ms => {
                let batch = self.flush();
                self.window_start = Some(ts);
                Some(batch)
            }
            Some(_) => None,
            None => {
                self.window_start = Some(ts);
                None
            }
        };
        self.buffer.push(record);
        flushed
    }

    /// Emit whatever is still buffered.
    pub fn finish(&mut self) -> Vec<GeoDetection> {
        self.window_start = None;
        self.flush()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn emitted(&self) -> usize {
        self.stats.output
    }

    /// Totals across every flushed window.
    pub fn stats(&self) -> DedupStats {
        self.stats.clone()
    }

    /// Final pass over everything emitted so far. The result is a fixpoint of
    /// `Deduplicator::deduplicate`; stats cover the whole stream.
    pub fn consolidate(&self, emitted: &[GeoDetection]) -> (Vec<GeoDetection>, DedupStats) {
        let (out, last) = self.dedup.deduplicate_with_stats(emitted);
        let stats = DedupStats {
            input: self.stats.input,
            filtered_out: self.stats.filtered_out + last.filtered_out,
            groups: self.stats.groups,
            output: last.output,
            passes: self.stats.passes.max(last.passes),
            removal_rate: removal_rate(self.stats.input, last.output),
        };
        (out, stats)
    }

    fn flush(&mut self) -> Vec<GeoDetection> {
        let batch = std::mem::take(&mut self.buffer);
        if batch.is_empty() {
            return batch;
        }
        let (out, window) = self.dedup.deduplicate_with_stats(&batch);
        self.stats.input += window.input;
        self.stats.filtered_out += window.filtered_out;
        self.stats.groups += window.groups;
        self.stats.output += window.output;
        self.stats.passes = self.stats.passes.max(window.passes);
        self.stats.removal_rate = removal_rate(self.stats.input, self.stats.output);
        log::debug!("Window flush: {} -> {} records", window.input, window.output);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::offset_latlon;

    fn record(ts: i64, east_m: f64, north_m: f64, confidence: f64, quality: GpsQuality) -> GeoDetection {
        let (lat, lon) = offset_latlon(22.78, 114.1, east_m, north_m);
        GeoDetection {
            class_id: 0,
            class_name: None,
            confidence,
            corner_lat: [lat; 4],
            corner_lon: [lon; 4],
            center_lat: lat,
            center_lon: lon,
            drone_lat: 22.78,
            drone_lon: 114.1,
            altitude_m: 100.0,
            gps_quality: quality,
            positioning_state: None,
            estimated_error_m: 3.0,
            is_on_edge: false,
            edge_sides: Vec::new(),
            frame_number: ts as u64 / 33,
            timestamp_ms: ts,
            pose_source: SourceKind::Push,
            quality_score: None,
        }
    }

    fn scattered() -> Vec<GeoDetection> {
        // Chain of sightings 3 m apart plus two isolated objects
        let mut records = Vec::new();
        for i in 0..8 {
            records.push(record(i * 100, i as f64 * 3.0, 0.0, 0.5 + 0.05 * i as f64, GpsQuality::Medium));
        }
        records.push(record(50, 200.0, 200.0, 0.9, GpsQuality::High));
        records.push(record(950, -150.0, 40.0, 0.4, GpsQuality::Low));
        records
    }

    #[test]
    fn test_five_sightings_collapse_to_rtk_record() {
        let confidences = [0.6, 0.7, 0.92, 0.88, 0.65];
        let offsets = [(0.0, 0.0), (1.0, 0.5), (0.5, 1.0), (1.5, 1.2), (0.2, 1.8)];
        let records: Vec<GeoDetection> = confidences
            .iter()
            .zip(offsets.iter())
            .enumerate()
            .map(|(i, (&conf, &(e, n)))| {
                let quality = if conf == 0.92 { GpsQuality::Rtk } else { GpsQuality::High };
                record(i as i64 * 33, e, n, conf, quality)
            })
            .collect();

        let out = deduplicate(&records, 5.0, 0.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.92);
        assert_eq!(out[0].gps_quality, GpsQuality::Rtk);
        assert_eq!(out[0].center_lat, records[2].center_lat);
    }

    #[test]
    fn test_score_factors() {
        let dedup = Deduplicator::new(DedupConfig::default());
        let mut r = record(0, 0.0, 0.0, 0.8, GpsQuality::Rtk);
        assert!((dedup.quality_score(&r) - 0.96).abs() < 1e-12);

        r.is_on_edge = true;
        r.estimated_error_m = 12.0;
        assert!((dedup.quality_score(&r) - 0.8 * 0.5 * 1.2 * 0.8).abs() < 1e-12);

        r.pose_source = SourceKind::Ocr;
        assert!((dedup.quality_score(&r) - 0.8 * 0.5 * 0.6 * 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_output_never_grows_and_members_come_from_input() {
        let input = scattered();
        let out = deduplicate(&input, 5.0, 0.0);
        assert!(out.len() <= input.len());
        for rec in &out {
            assert!(input
                .iter()
                .any(|r| r.center_lat == rec.center_lat && r.timestamp_ms == rec.timestamp_ms));
        }
    }

    #[test]
    fn test_idempotent() {
        for threshold in [2.0, 5.0, 7.0, 20.0] {
            let once = deduplicate(&scattered(), threshold, 0.0);
            let twice = deduplicate(&once, threshold, 0.0);
            assert_eq!(once, twice, "threshold {}", threshold);
        }
    }

    #[test]
    fn test_spatial_index_matches_linear_scan() {
        let mut linear_cfg = DedupConfig::default();
        linear_cfg.use_spatial_index = false;
        let indexed_cfg = DedupConfig::default();

        for threshold in [1.0, 4.0, 5.0, 9.5] {
            linear_cfg.distance_threshold_m = threshold;
            let mut indexed = indexed_cfg.clone();
            indexed.distance_threshold_m = threshold;

            let a = Deduplicator::new(linear_cfg.clone()).deduplicate_with_stats(&scattered());
            let b = Deduplicator::new(indexed).deduplicate_with_stats(&scattered());
            assert_eq!(a, b);
        }

        // Two sightings 2.2 m apart on either side of the antimeridian
        let mut west = record(0, 0.0, 0.0, 0.8, GpsQuality::High);
        west.center_lat = 10.0;
        west.center_lon = 179.99999;
        let mut east = record(100, 0.0, 0.0, 0.9, GpsQuality::High);
        east.center_lat = 10.0;
        east.center_lon = -179.99999;
        let straddling = vec![west, east];

        linear_cfg.distance_threshold_m = 5.0;
        let linear = Deduplicator::new(linear_cfg).deduplicate(&straddling);
        let indexed = Deduplicator::new(indexed_cfg).deduplicate(&straddling);
        assert_eq!(linear.len(), 1);
        assert_eq!(indexed, linear);
    }

    #[test]
    fn test_min_score_filter_applies_before_grouping() {
        let records = vec![
            record(0, 0.0, 0.0, 0.2, GpsQuality::Medium),
            record(100, 1.0, 0.0, 0.9, GpsQuality::High),
            record(200, 100.0, 0.0, 0.3, GpsQuality::Low),
        ];
        let dedup = Deduplicator::new(DedupConfig {
            min_quality_score: 0.25,
            ..DedupConfig::default()
        });
        let (out, stats) = dedup.deduplicate_with_stats(&records);
        assert_eq!(stats.filtered_out, 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp_ms, 100);
    }

    #[test]
    fn test_ties_keep_earliest_record() {
        let records = vec![
            record(300, 1.0, 0.0, 0.8, GpsQuality::High),
            record(100, 0.0, 0.0, 0.8, GpsQuality::High),
            record(200, 0.5, 0.0, 0.8, GpsQuality::High),
        ];
        let out = deduplicate(&records, 5.0, 0.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp_ms, 100);
    }

    #[test]
    fn test_output_sorted_by_time() {
        let out = deduplicate(&scattered(), 5.0, 0.0);
        assert!(out.windows(2).all(|w| by_time(&w[0], &w[1]) != Ordering::Greater));
        assert!(out.iter().all(|r| r.quality_score.is_some()));
    }

    #[test]
    fn test_empty_input() {
        let (out, stats) = Deduplicator::new(DedupConfig::default()).deduplicate_with_stats(&[]);
        assert!(out.is_empty());
        assert_eq!(stats.removal_rate, 0.0);
    }

    #[test]
    fn test_windowed_emits_deduplicated_batches() {
        let config = DedupConfig {
            window_ms: 1_000,
            ..DedupConfig::default()
        };
        let mut windowed = WindowedDeduplicator::new(config.clone());
        let mut emitted = Vec::new();

        for i in 0..30 {
            // Same spot, one sighting every 100 ms
            if let Some(batch) = windowed.push(record(i * 100, 0.2 * i as f64 % 1.0, 0.0, 0.7, GpsQuality::High)) {
                emitted.push(batch);
            }
        }
        let rest = windowed.finish();
        assert_eq!(windowed.pending(), 0);
        emitted.push(rest);

        assert_eq!(emitted.len(), 3);
        let dedup = Deduplicator::new(config);
        for batch in &emitted {
            assert_eq!(batch.len(), 1);
            assert_eq!(&dedup.deduplicate(batch), batch);
        }
        assert_eq!(windowed.emitted(), 3);
        assert_eq!(windowed.stats().input, 30);

        // One object seen in every window collapses once the batches are merged
        let flat: Vec<GeoDetection> = emitted.into_iter().flatten().collect();
        let (merged, stats) = windowed.consolidate(&flat);
        assert_eq!(merged.len(), 1);
        assert_eq!(dedup.deduplicate(&merged), merged);
        assert_eq!(stats.input, 30);
        assert_eq!(stats.output, 1);
    }
}
