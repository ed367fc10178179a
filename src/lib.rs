//! Aerial video geolocation
//!
//! Turns pixel-space detections from a drone camera into geographic
//! coordinates, using a time-synchronized aircraft pose, and collapses
//! repeated sightings of the same object into one record.

pub mod builder;
pub mod camera;
pub mod config;
pub mod dedup;
pub mod error;
pub mod export;
pub mod geodesy;
pub mod gps_quality;
pub mod pipeline;
pub mod projection;
pub mod sources;
pub mod sync;
pub mod types;

pub use builder::GeoDetectionBuilder;
pub use camera::CameraModel;
pub use config::GeolocConfig;
pub use dedup::{deduplicate, Deduplicator, WindowedDeduplicator};
pub use error::{GeolocError, GeolocResult};
pub use export::{Exporter, JsonExporter};
pub use gps_quality::GpsQualityEvaluator;
pub use pipeline::{Detector, FrameQueue, GeoPipeline, RunOutput, VideoFrame};
pub use projection::GroundProjector;
pub use sources::{PoseBuffer, PoseSource};
pub use sync::{FailoverState, PoseSynchronizer};
pub use types::{Detection, GeoDetection, GpsQuality, PixelBox, PoseSample, SourceKind};
