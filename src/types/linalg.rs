//! Linear algebra type aliases for the projection math
//!
//! All world-frame vectors are local East-North-Up (ENU) in meters, anchored at
//! the aircraft position. Camera-frame vectors use x right, y down, z forward.

use nalgebra::{Matrix3, Rotation3, Vector3};

// ===== Axis indices (ENU) =====
pub const AXIS_EAST: usize = 0;
pub const AXIS_NORTH: usize = 1;
pub const AXIS_UP: usize = 2;

// ===== Vector types =====
pub type EnuVec = Vector3<f64>;
pub type CameraRay = Vector3<f64>;

// ===== Rotation types =====
pub type Attitude = Rotation3<f64>;

/// Maps camera axes onto a level, north-facing body: x → East, y → Down, z → North.
pub fn level_camera_basis() -> Matrix3<f64> {
    Matrix3::new(
        1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, //
        0.0, -1.0, 0.0,
    )
}
