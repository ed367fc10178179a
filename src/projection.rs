// projection.rs: Pixel → ground projection (camera / attitude model)
//
// Frames:
//   camera: x right, y down, z forward (optical axis)
//   world:  local ENU at the aircraft, meters
//
// Attitude: yaw clockwise from north, pitch negative looking down, roll positive
// banking right, composed intrinsically yaw → pitch → roll. When gimbal angles
// are present the ray goes through the gimbal rotation first, then the aircraft
// rotation. The ground is a horizontal plane at `ground_elevation_m`.

use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::camera::CameraModel;
use crate::config::ProjectionConfig;
use crate::error::{GeolocError, GeolocResult};
use crate::geodesy::offset_latlon;
use crate::types::{level_camera_basis, Attitude, EdgeSide, EnuVec, PoseSample, AXIS_EAST, AXIS_NORTH, AXIS_UP};

/// Smallest |up| accepted when the grazing limit is configured as zero.
const MIN_UP_COMPONENT: f64 = 1e-6;

/// Geographic footprint of a pixel quadrilateral.
#[derive(Clone, Debug, PartialEq)]
pub struct Footprint {
    pub corner_lat: [f64; 4],
    pub corner_lon: [f64; 4],
    pub center_lat: f64,
    pub center_lon: f64,
    /// Ground offsets (east, north) of each corner from the aircraft, meters
    pub corner_offsets_m: [(f64, f64); 4],
    pub used_fast_path: bool,
}

/// Rotation for one yaw/pitch/roll triple in degrees.
pub fn attitude_rotation(yaw_deg: f64, pitch_deg: f64, roll_deg: f64) -> Attitude {
    let yaw = Rotation3::from_axis_angle(&Vector3::z_axis(), -yaw_deg.to_radians());
    let pitch = Rotation3::from_axis_angle(&Vector3::x_axis(), pitch_deg.to_radians());
    let roll = Rotation3::from_axis_angle(&Vector3::y_axis(), roll_deg.to_radians());
    yaw * pitch * roll
}

pub struct GroundProjector {
    camera: CameraModel,
    config: ProjectionConfig,
    min_down: f64,
}

impl GroundProjector {
    pub fn new(camera: CameraModel, config: ProjectionConfig) -> GeolocResult<Self> {
        camera.validate()?;
        let min_down = config.min_grazing_angle_deg.to_radians().sin().max(MIN_UP_COMPONENT);
        Ok(Self {
            camera,
            config,
            min_down,
        })
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn config(&self) -> &ProjectionConfig {
        &self.config
    }

    /// Camera-frame → world-frame matrix for a pose.
    pub fn camera_to_world(&self, pose: &PoseSample) -> Matrix3<f64> {
        let aircraft = attitude_rotation(pose.yaw_deg, pose.pitch_deg, pose.roll_deg);
        let mounted = if pose.has_gimbal() {
            let gimbal = attitude_rotation(
                pose.gimbal_yaw.unwrap_or(0.0),
                pose.gimbal_pitch.unwrap_or(0.0),
                pose.gimbal_roll.unwrap_or(0.0),
            );
            aircraft * gimbal
        } else {
            aircraft
        };
        mounted.matrix() * level_camera_basis()
    }

    /// Nadir with no roll and no gimbal: the orthographic fast path is exact here.
    pub fn is_nadir(&self, pose: &PoseSample) -> bool {
        let tol = self.config.nadir_tolerance_deg;
        !pose.has_gimbal() && (pose.pitch_deg + 90.0).abs() <= tol && pose.roll_deg.abs() <= tol
    }

    fn height_above_ground(&self, pose: &PoseSample) -> GeolocResult<f64> {
        let height_m = pose.altitude_m - self.config.ground_elevation_m;
        if height_m <= 0.0 {
            return Err(GeolocError::BelowGround { height_m });
        }
        Ok(height_m)
    }

    /// General ray/ground-plane intersection. Returns the (east, north) offset in meters.
    pub fn ground_offset_general(&self, u: f64, v: f64, pose: &PoseSample, corner: usize) -> GeolocResult<(f64, f64)> {
        let height_m = self.height_above_ground(pose)?;
        let world: EnuVec = (self.camera_to_world(pose) * self.camera.pixel_to_ray(u, v)).normalize();

        let up = world[AXIS_UP];
        if up > -self.min_down {
            return Err(GeolocError::Geometry { corner, up });
        }

        let t = height_m / -up;
        Ok((t * world[AXIS_EAST], t * world[AXIS_NORTH]))
    }

    /// Orthographic GSD scaling rotated by yaw. Only valid at nadir.
    pub fn ground_offset_nadir(&self, u: f64, v: f64, pose: &PoseSample) -> GeolocResult<(f64, f64)> {
        let height_m = self.height_above_ground(pose)?;
        let (gsd_x, gsd_y) = self.camera.gsd(height_m);

        // Image right = east and image up = north when yaw = 0
        let dx = (u - self.camera.cx()) * gsd_x;
        let dy = -(v - self.camera.cy()) * gsd_y;

        let (sin_yaw, cos_yaw) = pose.yaw_deg.to_radians().sin_cos();
        let east = dx * cos_yaw + dy * sin_yaw;
        let north = -dx * sin_yaw + dy * cos_yaw;
        Ok((east, north))
    }

    fn ground_offset(&self, u: f64, v: f64, pose: &PoseSample, corner: usize) -> GeolocResult<((f64, f64), bool)> {
        if self.config.use_nadir_fast_path && self.is_nadir(pose) {
            Ok((self.ground_offset_nadir(u, v, pose)?, true))
        } else {
            Ok((self.ground_offset_general(u, v, pose, corner)?, false))
        }
    }

    /// Project one pixel to (lat, lon).
    pub fn project(&self, pixel: (f64, f64), pose: &PoseSample) -> GeolocResult<(f64, f64)> {
        let ((east, north), _) = self.ground_offset(pixel.0, pixel.1, pose, 0)?;
        Ok(offset_latlon(pose.lat, pose.lon, east, north))
    }

    /// Project all four corners independently; the center is their mean.
    ///
    /// Any corner that misses the ground fails the whole box, carrying that
    /// corner's index in the error.
    pub fn project_box(&self, corners: &[(f64, f64); 4], pose: &PoseSample) -> GeolocResult<Footprint> {
        let mut corner_lat = [0.0; 4];
        let mut corner_lon = [0.0; 4];
        let mut corner_offsets_m = [(0.0, 0.0); 4];
        let mut used_fast_path = false;

        for (idx, &(u, v)) in corners.iter().enumerate() {
            let ((east, north), fast) = self.ground_offset(u, v, pose, idx)?;
            let (lat, lon) = offset_latlon(pose.lat, pose.lon, east, north);
            corner_lat[idx] = lat;
            corner_lon[idx] = lon;
            corner_offsets_m[idx] = (east, north);
            used_fast_path = fast;
        }

        Ok(Footprint {
            corner_lat,
            corner_lon,
            center_lat: corner_lat.iter().sum::<f64>() / 4.0,
            center_lon: corner_lon.iter().sum::<f64>() / 4.0,
            corner_offsets_m,
            used_fast_path,
        })
    }

    /// Image borders touched by any corner within the configured margin.
    pub fn edge_sides(&self, corners: &[(f64, f64); 4]) -> Vec<EdgeSide> {
        let margin = self.config.edge_margin_px;
        let width = self.camera.image_width as f64;
        let height = self.camera.image_height as f64;

        let mut sides = Vec::new();
        if corners.iter().any(|&(u, _)| u <= margin) {
            sides.push(EdgeSide::Left);
        }
        if corners.iter().any(|&(u, _)| u >= width - margin) {
            sides.push(EdgeSide::Right);
        }
        if corners.iter().any(|&(_, v)| v <= margin) {
            sides.push(EdgeSide::Top);
        }
        if corners.iter().any(|&(_, v)| v >= height - margin) {
            sides.push(EdgeSide::Bottom);
        }
        sides
    }
}
