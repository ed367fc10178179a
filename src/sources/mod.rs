//! Telemetry providers
//!
//! Every transport owns one [`PoseBuffer`] and exposes it through the
//! [`PoseSource`] trait. Producers (file loaders, message handlers, poll
//! workers) write into the buffer; the synchronizer only reads.

pub mod http_poll;
pub mod osd_text;
pub mod push_feed;
pub mod srt;

pub use http_poll::{HttpPollConfig, HttpPollSource};
pub use osd_text::OsdTextSource;
pub use push_feed::PushFeedSource;
pub use srt::SrtLogSource;

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{PoseSample, SourceKind};

/// Default ring capacity for live sources.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

/// Time-ordered pose ring buffer
///
/// In-order appends are O(1); a late sample is inserted at its sorted position.
/// When a capacity is set, the oldest sample is evicted on overflow.
pub struct PoseBuffer {
    inner: Mutex<VecDeque<PoseSample>>,
    capacity: Option<usize>,
}

impl PoseBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.unwrap_or(0))),
            capacity,
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity))
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<PoseSample>> {
        // A panicked writer cannot leave a half-inserted sample behind
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn push(&self, sample: PoseSample) {
        let mut buf = self.guard();
        let in_order = buf.back().map_or(true, |last| last.timestamp_ms <= sample.timestamp_ms);
        if in_order {
            buf.push_back(sample);
        } else {
            let idx = buf.partition_point(|s| s.timestamp_ms <= sample.timestamp_ms);
            buf.insert(idx, sample);
        }
        if let Some(cap) = self.capacity {
            while buf.len() > cap {
                buf.pop_front();
            }
        }
    }

    pub fn latest(&self) -> Option<PoseSample> {
        self.guard().back().cloned()
    }

    /// Sample closest in time, if within `tolerance_ms`. Equal distances pick the earlier sample.
    pub fn nearest(&self, timestamp_ms: i64, tolerance_ms: i64) -> Option<PoseSample> {
        let buf = self.guard();
        let idx = buf.partition_point(|s| s.timestamp_ms < timestamp_ms);

        let before = idx.checked_sub(1).and_then(|i| buf.get(i));
        let after = buf.get(idx);
        let best = match (before, after) {
            (Some(b), Some(a)) => {
                if timestamp_ms - b.timestamp_ms <= a.timestamp_ms - timestamp_ms {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        if (best.timestamp_ms - timestamp_ms).abs() <= tolerance_ms {
            Some(best.clone())
        } else {
            None
        }
    }

    /// Samples immediately at-or-before and at-or-after `timestamp_ms`.
    pub fn bracket(&self, timestamp_ms: i64) -> Option<(PoseSample, PoseSample)> {
        let buf = self.guard();
        let idx = buf.partition_point(|s| s.timestamp_ms <= timestamp_ms);
        let before = idx.checked_sub(1).and_then(|i| buf.get(i))?;
        if before.timestamp_ms == timestamp_ms {
            return Some((before.clone(), before.clone()));
        }
        let after = buf.get(idx)?;
        Some((before.clone(), after.clone()))
    }

    /// Sample tagged with `frame_number`, if any.
    pub fn by_frame(&self, frame_number: u64) -> Option<PoseSample> {
        self.guard()
            .iter()
            .find(|s| s.frame_number == Some(frame_number))
            .cloned()
    }

    /// Drop samples older than `timestamp_ms`; returns how many were removed.
    pub fn evict_before(&self, timestamp_ms: i64) -> usize {
        let mut buf = self.guard();
        let idx = buf.partition_point(|s| s.timestamp_ms < timestamp_ms);
        buf.drain(..idx);
        idx
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }
}

/// One telemetry provider feeding the synchronizer.
pub trait PoseSource: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn buffer(&self) -> &PoseBuffer;

    /// Transport health. `false` makes the synchronizer fail over immediately.
    fn is_available(&self) -> bool;

    fn nearest(&self, timestamp_ms: i64, tolerance_ms: i64) -> Option<PoseSample> {
        self.buffer().nearest(timestamp_ms, tolerance_ms)
    }

    fn latest(&self) -> Option<PoseSample> {
        self.buffer().latest()
    }

    fn by_frame(&self, frame_number: u64) -> Option<PoseSample> {
        self.buffer().by_frame(frame_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64) -> PoseSample {
        PoseSample::new(ts, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0)
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let buf = PoseBuffer::bounded(3);
        for ts in [0, 100, 200, 300, 400] {
            buf.push(sample(ts));
        }
        assert_eq!(buf.len(), 3);
        assert!(buf.nearest(0, 50).is_none());
        assert_eq!(buf.latest().map(|s| s.timestamp_ms), Some(400));
    }

    #[test]
    fn test_late_sample_inserted_in_order() {
        let buf = PoseBuffer::unbounded();
        for ts in [0, 200, 100, 300, 50] {
            buf.push(sample(ts));
        }
        assert_eq!(buf.latest().map(|s| s.timestamp_ms), Some(300));
        assert_eq!(buf.nearest(60, 20).map(|s| s.timestamp_ms), Some(50));
        assert_eq!(buf.bracket(150).map(|(a, b)| (a.timestamp_ms, b.timestamp_ms)), Some((100, 200)));
    }

    #[test]
    fn test_nearest_respects_tolerance_and_tie() {
        let buf = PoseBuffer::unbounded();
        buf.push(sample(1000));
        buf.push(sample(1100));

        assert_eq!(buf.nearest(1050, 100).map(|s| s.timestamp_ms), Some(1000));
        assert_eq!(buf.nearest(1090, 100).map(|s| s.timestamp_ms), Some(1100));
        assert_eq!(buf.nearest(1200, 100).map(|s| s.timestamp_ms), Some(1100));
        assert!(buf.nearest(1201, 100).is_none());
        assert!(buf.nearest(850, 100).is_none());
    }

    #[test]
    fn test_bracket_edges() {
        let buf = PoseBuffer::unbounded();
        assert!(buf.bracket(10).is_none());
        buf.push(sample(100));
        buf.push(sample(200));
        assert!(buf.bracket(50).is_none());
        assert!(buf.bracket(250).is_none());
        assert_eq!(buf.bracket(200).map(|(a, b)| (a.timestamp_ms, b.timestamp_ms)), Some((200, 200)));
    }

    #[test]
    fn test_evict_before() {
        let buf = PoseBuffer::unbounded();
        for ts in (0..10).map(|i| i * 100) {
            buf.push(sample(ts));
        }
        assert_eq!(buf.evict_before(450), 5);
        assert_eq!(buf.len(), 5);
        assert!(buf.nearest(400, 40).is_none());
        buf.clear();
        assert!(buf.is_empty());
    }
}
