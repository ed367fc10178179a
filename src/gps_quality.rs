// gps_quality.rs: Telemetry confidence from partial receiver fields
//
// Ordered decision table, first match wins. Absence of a quality signal is not
// a bad signal: a pose with no level, no satellite count and no positioning
// state is MEDIUM, never INVALID.

use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::types::{GpsQuality, PoseSample, SourceKind};

// ===== Error estimates per class (meters) =====
pub const RTK_FIXED_ERROR_M: f64 = 0.05;
pub const RTK_FLOAT_ERROR_M: f64 = 0.5;
pub const DGPS_ERROR_M: f64 = 2.0;
pub const HIGH_ERROR_M: f64 = 3.0;
pub const MEDIUM_ERROR_M: f64 = 5.0;
pub const LOW_ERROR_M: f64 = 8.0;
pub const INVALID_ERROR_M: f64 = 10.0;
pub const OCR_ERROR_M: f64 = 15.0;

/// Satellite count at which a fix counts as HIGH.
const HIGH_SATELLITE_COUNT: u32 = 15;
/// Signal level at which a fix counts as HIGH.
const HIGH_GPS_LEVEL: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub quality: GpsQuality,
    pub estimated_error_m: f64,
    /// Whether the skip policy is allowed to drop this pose
    pub skippable: bool,
}

impl QualityAssessment {
    fn new(quality: GpsQuality, estimated_error_m: f64, skippable: bool) -> Self {
        Self {
            quality,
            estimated_error_m,
            skippable,
        }
    }
}

pub struct GpsQualityEvaluator {
    config: QualityConfig,
}

impl GpsQualityEvaluator {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn evaluate(&self, pose: &PoseSample) -> QualityAssessment {
        use GpsQuality::*;

        if !self.config.enabled {
            return QualityAssessment::new(Medium, MEDIUM_ERROR_M, false);
        }

        let level = pose.gps_level;
        let sats = pose.satellite_count;

        if let Some(level) = level {
            if level < self.config.invalid_below_level {
                return QualityAssessment::new(Invalid, INVALID_ERROR_M, true);
            }
            if level < self.config.min_gps_level {
                return QualityAssessment::new(Low, LOW_ERROR_M, true);
            }
        }

        if let Some(state) = pose.positioning_state.as_deref() {
            let state = state.to_ascii_uppercase();
            if state.contains("RTK_FIXED") {
                return QualityAssessment::new(Rtk, RTK_FIXED_ERROR_M, false);
            }
            if state.contains("RTK_FLOAT") {
                return QualityAssessment::new(High, RTK_FLOAT_ERROR_M, false);
            }
            if state.contains("DGPS") {
                return QualityAssessment::new(High, DGPS_ERROR_M, false);
            }
        }

        // Overlay text carries no receiver state; never promote it
        if pose.source_kind == SourceKind::Ocr {
            return QualityAssessment::new(Low, OCR_ERROR_M, false);
        }

        match (level, sats) {
            (Some(level), Some(sats)) => {
                if level >= HIGH_GPS_LEVEL && sats >= HIGH_SATELLITE_COUNT {
                    QualityAssessment::new(High, HIGH_ERROR_M, false)
                } else if sats >= self.config.min_satellite_count {
                    QualityAssessment::new(Medium, MEDIUM_ERROR_M, false)
                } else {
                    QualityAssessment::new(Low, LOW_ERROR_M, true)
                }
            }
            (Some(_), None) => QualityAssessment::new(Medium, MEDIUM_ERROR_M, false),
            (None, Some(sats)) => {
                if sats >= HIGH_SATELLITE_COUNT {
                    QualityAssessment::new(High, HIGH_ERROR_M, false)
                } else if sats >= self.config.min_satellite_count {
                    QualityAssessment::new(Medium, MEDIUM_ERROR_M, false)
                } else {
                    QualityAssessment::new(Low, LOW_ERROR_M, false)
                }
            }
            (None, None) => QualityAssessment::new(Medium, MEDIUM_ERROR_M, false),
        }
    }

    /// Whether a detection made with this assessment should be dropped.
    pub fn should_skip(&self, assessment: &QualityAssessment) -> bool {
        self.config.skip_on_low_quality && assessment.skippable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> GpsQualityEvaluator {
        GpsQualityEvaluator::new(QualityConfig::default())
    }

    fn pose(level: Option<u8>, sats: Option<u32>, state: Option<&str>) -> PoseSample {
        PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0).with_quality(level, sats, state)
    }

    #[test]
    fn test_missing_fields_are_medium_and_kept() {
        let eval = evaluator();
        let bridged = pose(None, None, None).with_source("http", SourceKind::Poll);
        let a = eval.evaluate(&bridged);
        assert_eq!(a.quality, GpsQuality::Medium);
        assert_eq!(a.estimated_error_m, MEDIUM_ERROR_M);
        assert!(!eval.should_skip(&a));
    }

    #[test]
    fn test_never_invalid_without_level_or_sats() {
        let eval = evaluator();
        for state in [None, Some(""), Some("GPS"), Some("SINGLE")] {
            let a = eval.evaluate(&pose(None, None, state));
            assert_ne!(a.quality, GpsQuality::Invalid);
            assert_eq!(a.quality, GpsQuality::Medium);
        }
    }

    #[test]
    fn test_rtk_fixed_wins_over_counts() {
        let a = evaluator().evaluate(&pose(Some(4), Some(8), Some("RTK_FIXED")));
        assert_eq!(a.quality, GpsQuality::Rtk);
        assert_eq!(a.estimated_error_m, RTK_FIXED_ERROR_M);

        let a = evaluator().evaluate(&pose(None, None, Some("rtk_fixed")));
        assert_eq!(a.quality, GpsQuality::Rtk);
    }

    #[test]
    fn test_low_level_cutoffs() {
        let eval = evaluator();
        let a = eval.evaluate(&pose(Some(0), Some(20), Some("RTK_FIXED")));
        assert_eq!(a.quality, GpsQuality::Invalid);
        assert!(eval.should_skip(&a));

        let a = eval.evaluate(&pose(Some(2), Some(20), None));
        assert_eq!(a.quality, GpsQuality::Low);
        assert!(eval.should_skip(&a));
    }

    #[test]
    fn test_level_and_satellite_grid() {
        let eval = evaluator();
        assert_eq!(eval.evaluate(&pose(Some(5), Some(15), None)).quality, GpsQuality::High);
        assert_eq!(eval.evaluate(&pose(Some(5), Some(12), None)).quality, GpsQuality::Medium);
        assert_eq!(eval.evaluate(&pose(Some(4), Some(10), None)).quality, GpsQuality::Medium);
        assert_eq!(eval.evaluate(&pose(Some(3), None, None)).quality, GpsQuality::Medium);

        let weak = eval.evaluate(&pose(Some(4), Some(6), None));
        assert_eq!(weak.quality, GpsQuality::Low);
        assert!(eval.should_skip(&weak));
    }

    #[test]
    fn test_missing_level_uses_satellites_only() {
        let eval = evaluator();
        assert_eq!(eval.evaluate(&pose(None, Some(18), None)).quality, GpsQuality::High);
        assert_eq!(eval.evaluate(&pose(None, Some(11), None)).quality, GpsQuality::Medium);

        let few = eval.evaluate(&pose(None, Some(5), None));
        assert_eq!(few.quality, GpsQuality::Low);
        assert!(!eval.should_skip(&few));
    }

    #[test]
    fn test_differential_states() {
        let eval = evaluator();
        let float = eval.evaluate(&pose(None, None, Some("RTK_FLOAT")));
        assert_eq!(float.quality, GpsQuality::High);
        assert_eq!(float.estimated_error_m, RTK_FLOAT_ERROR_M);

        let dgps = eval.evaluate(&pose(Some(4), Some(12), Some("DGPS")));
        assert_eq!(dgps.quality, GpsQuality::High);
        assert_eq!(dgps.estimated_error_m, DGPS_ERROR_M);
    }

    #[test]
    fn test_overlay_text_is_low_but_kept() {
        let eval = evaluator();
        let ocr = pose(Some(5), Some(20), None).with_source("osd", SourceKind::Ocr);
        let a = eval.evaluate(&ocr);
        assert_eq!(a.quality, GpsQuality::Low);
        assert_eq!(a.estimated_error_m, OCR_ERROR_M);
        assert!(!eval.should_skip(&a));
    }

    #[test]
    fn test_skip_policy_and_disabled_control() {
        let mut config = QualityConfig::default();
        config.skip_on_low_quality = false;
        let eval = GpsQualityEvaluator::new(config);
        let a = eval.evaluate(&pose(Some(0), None, None));
        assert_eq!(a.quality, GpsQuality::Invalid);
        assert!(!eval.should_skip(&a));

        let mut config = QualityConfig::default();
        config.enabled = false;
        let eval = GpsQualityEvaluator::new(config);
        let a = eval.evaluate(&pose(Some(0), Some(0), None));
        assert_eq!(a.quality, GpsQuality::Medium);
    }
}
