use crate::camera::CameraModel;
use crate::config::{ErrorModel, GeolocConfig};
use crate::error::{GeolocError, GeolocResult};
use crate::gps_quality::{GpsQualityEvaluator, QualityAssessment};
use crate::projection::GroundProjector;
use crate::types::{Detection, GeoDetection, PoseSample};

/// Relative altitude error assumed by the combined error model.
const ALTITUDE_ERROR_FRACTION: f64 = 0.01;
/// Attitude error assumed by the combined error model, degrees.
const ATTITUDE_ERROR_DEG: f64 = 1.0;

/// Assembles a detection and its matched pose into a geolocated record.
pub struct GeoDetectionBuilder {
    projector: GroundProjector,
    evaluator: GpsQualityEvaluator,
    error_model: ErrorModel,
}

impl GeoDetectionBuilder {
    pub fn new(projector: GroundProjector, evaluator: GpsQualityEvaluator) -> Self {
        let error_model = projector.config().error_model;
        Self {
            projector,
            evaluator,
            error_model,
        }
    }

    pub fn from_config(config: &GeolocConfig) -> GeolocResult<Self> {
        let projector = GroundProjector::new(config.camera.clone(), config.projection.clone())?;
        Ok(Self::new(projector, GpsQualityEvaluator::new(config.quality.clone())))
    }

    pub fn camera(&self) -> &CameraModel {
        self.projector.camera()
    }

    pub fn projector(&self) -> &GroundProjector {
        &self.projector
    }

    /// Evaluate a pose, failing with `LowGpsQuality` when the skip policy drops it.
    pub fn assess(&self, pose: &PoseSample) -> GeolocResult<QualityAssessment> {
        let assessment = self.evaluator.evaluate(pose);
        if self.evaluator.should_skip(&assessment) {
            return Err(GeolocError::LowGpsQuality {
                quality: assessment.quality,
            });
        }
        Ok(assessment)
    }

    pub fn build(&self, detection: &Detection, pose: &PoseSample) -> GeolocResult<GeoDetection> {
        let assessment = self.assess(pose)?;
        self.build_assessed(detection, pose, &assessment)
    }

    /// Build with a quality assessment already made for this pose.
    pub fn build_assessed(
        &self,
        detection: &Detection,
        pose: &PoseSample,
        assessment: &QualityAssessment,
    ) -> GeolocResult<GeoDetection> {
        let corners = detection.bbox.corners();
        let footprint = self.projector.project_box(&corners, pose)?;
        let edge_sides = self.projector.edge_sides(&corners);

        Ok(GeoDetection {
            class_id: detection.class_id,
            class_name: detection.class_name.clone(),
            confidence: detection.confidence.clamp(0.0, 1.0),
            corner_lat: footprint.corner_lat,
            corner_lon: footprint.corner_lon,
            center_lat: footprint.center_lat,
            center_lon: footprint.center_lon,
            drone_lat: pose.lat,
            drone_lon: pose.lon,
            altitude_m: pose.altitude_m,
            gps_quality: assessment.quality,
            positioning_state: pose.positioning_state.clone(),
            estimated_error_m: self.estimated_error(assessment.estimated_error_m, pose),
            is_on_edge: !edge_sides.is_empty(),
            edge_sides,
            frame_number: detection.frame_number,
            timestamp_ms: detection.frame_timestamp_ms,
            pose_source: pose.source_kind,
            quality_score: None,
        })
    }

    fn estimated_error(&self, gps_error_m: f64, pose: &PoseSample) -> f64 {
        match self.error_model {
            ErrorModel::GpsOnly => gps_error_m,
            ErrorModel::Combined => {
                let height = pose.altitude_m.abs();
                let altitude_term = height * ALTITUDE_ERROR_FRACTION;
                let attitude_term = height * ATTITUDE_ERROR_DEG.to_radians().sin();
                (gps_error_m.powi(2) + altitude_term.powi(2) + attitude_term.powi(2)).sqrt()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeSide, GpsQuality, PixelBox, SourceKind};
    use approx::assert_relative_eq;

    fn phantom_config() -> GeolocConfig {
        let mut config = GeolocConfig::default();
        config.camera = CameraModel::new(5472, 3648, 13.2, 8.8, 8.8);
        config
    }

    fn centered_detection(confidence: f64) -> Detection {
        let bbox = PixelBox::Rect { x1: 2636.0, y1: 1724.0, x2: 2836.0, y2: 1924.0 };
        Detection::new(7, 1_500, bbox, 2, confidence)
    }

    #[test]
    fn test_build_fills_record_from_pose() {
        let builder = GeoDetectionBuilder::from_config(&phantom_config()).unwrap();
        let pose = PoseSample::new(1_480, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0)
            .with_quality(Some(5), Some(18), None)
            .with_source("push", SourceKind::Push);

        let record = builder.build(&centered_detection(0.8), &pose).unwrap();
        assert_relative_eq!(record.center_lat, 22.78, epsilon = 1e-9);
        assert_relative_eq!(record.center_lon, 114.1, epsilon = 1e-9);
        assert_eq!(record.drone_lat, 22.78);
        assert_eq!(record.gps_quality, GpsQuality::High);
        assert_eq!(record.estimated_error_m, 3.0);
        assert_eq!(record.frame_number, 7);
        assert_eq!(record.timestamp_ms, 1_500);
        assert_eq!(record.pose_source, SourceKind::Push);
        assert!(!record.is_on_edge);
        assert!(record.quality_score.is_none());
    }

    #[test]
    fn test_bridged_pose_is_not_dropped() {
        let builder = GeoDetectionBuilder::from_config(&phantom_config()).unwrap();
        let pose = PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0).with_source("http", SourceKind::Poll);
        let record = builder.build(&centered_detection(0.5), &pose).unwrap();
        assert_eq!(record.gps_quality, GpsQuality::Medium);
    }

    #[test]
    fn test_low_quality_pose_rejected_by_policy() {
        let builder = GeoDetectionBuilder::from_config(&phantom_config()).unwrap();
        let pose = PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0).with_quality(Some(0), None, None);
        assert!(matches!(
            builder.build(&centered_detection(0.5), &pose),
            Err(GeolocError::LowGpsQuality { quality: GpsQuality::Invalid })
        ));
    }

    #[test]
    fn test_confidence_clamped_and_edge_flagged() {
        let builder = GeoDetectionBuilder::from_config(&phantom_config()).unwrap();
        let pose = PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0);
        let bbox = PixelBox::Rect { x1: 0.0, y1: 100.0, x2: 80.0, y2: 200.0 };
        let record = builder.build(&Detection::new(1, 0, bbox, 0, 1.3), &pose).unwrap();
        assert_eq!(record.confidence, 1.0);
        assert!(record.is_on_edge);
        assert_eq!(record.edge_sides, vec![EdgeSide::Left]);
    }

    #[test]
    fn test_combined_error_model_grows_with_altitude() {
        let mut config = phantom_config();
        config.projection.error_model = ErrorModel::Combined;
        let builder = GeoDetectionBuilder::from_config(&config).unwrap();
        let pose = PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0);
        let record = builder.build(&centered_detection(0.5), &pose).unwrap();

        let expected = (25.0_f64 + 1.0 + (100.0 * 1.0_f64.to_radians().sin()).powi(2)).sqrt();
        assert_relative_eq!(record.estimated_error_m, expected, epsilon = 1e-12);
    }
}
