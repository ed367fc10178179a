use serde::{Deserialize, Serialize};

use crate::error::{GeolocError, GeolocResult};
use crate::types::CameraRay;

/// Pinhole camera intrinsics
///
/// Sensor dimensions and focal length are in millimeters, image dimensions and
/// principal point in pixels. The principal point defaults to the image center.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraModel {
    pub image_width: u32,
    pub image_height: u32,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub focal_length_mm: f64,
    pub principal_point_x: Option<f64>,
    pub principal_point_y: Option<f64>,
}

impl Default for CameraModel {
    fn default() -> Self {
        // Wide camera of the M4TD class, 1/1.3" sensor
        Self {
            image_width: 4032,
            image_height: 3024,
            sensor_width_mm: 13.4,
            sensor_height_mm: 9.6,
            focal_length_mm: 7.0,
            principal_point_x: None,
            principal_point_y: None,
        }
    }
}

impl CameraModel {
    pub fn new(
        image_width: u32,
        image_height: u32,
        sensor_width_mm: f64,
        sensor_height_mm: f64,
        focal_length_mm: f64,
    ) -> Self {
        Self {
            image_width,
            image_height,
            sensor_width_mm,
            sensor_height_mm,
            focal_length_mm,
            principal_point_x: None,
            principal_point_y: None,
        }
    }

    pub fn cx(&self) -> f64 {
        self.principal_point_x.unwrap_or(self.image_width as f64 / 2.0)
    }

    pub fn cy(&self) -> f64 {
        self.principal_point_y.unwrap_or(self.image_height as f64 / 2.0)
    }

    /// Physical pixel pitch (mm per pixel) along x and y.
    pub fn pixel_pitch_mm(&self) -> (f64, f64) {
        (
            self.sensor_width_mm / self.image_width as f64,
            self.sensor_height_mm / self.image_height as f64,
        )
    }

    /// Ground sample distance (meters per pixel) at the given height above ground.
    ///
    /// GSD = sensor_dim * height / (focal_length * image_dim)
    pub fn gsd(&self, height_m: f64) -> (f64, f64) {
        let gsd_x = self.sensor_width_mm * height_m / (self.focal_length_mm * self.image_width as f64);
        let gsd_y = self.sensor_height_mm * height_m / (self.focal_length_mm * self.image_height as f64);
        (gsd_x, gsd_y)
    }

    /// Camera-frame ray through a pixel: x right, y down, z forward (z = 1).
    pub fn pixel_to_ray(&self, u: f64, v: f64) -> CameraRay {
        let (pitch_x, pitch_y) = self.pixel_pitch_mm();
        CameraRay::new(
            (u - self.cx()) * pitch_x / self.focal_length_mm,
            (v - self.cy()) * pitch_y / self.focal_length_mm,
            1.0,
        )
    }

    pub fn validate(&self) -> GeolocResult<()> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(GeolocError::InvalidConfig(format!(
                "image size must be > 0, got {}x{}",
                self.image_width, self.image_height
            )));
        }
        if !(self.sensor_width_mm > 0.0 && self.sensor_height_mm > 0.0) {
            return Err(GeolocError::InvalidConfig(format!(
                "sensor size must be > 0, got {}x{} mm",
                self.sensor_width_mm, self.sensor_height_mm
            )));
        }
        if !(self.focal_length_mm > 0.0) {
            return Err(GeolocError::InvalidConfig(format!(
                "focal length must be > 0, got {} mm",
                self.focal_length_mm
            )));
        }
        let (cx, cy) = (self.cx(), self.cy());
        if !(0.0..=self.image_width as f64).contains(&cx) || !(0.0..=self.image_height as f64).contains(&cy) {
            return Err(GeolocError::InvalidConfig(format!(
                "principal point ({cx}, {cy}) outside the image"
            )));
        }
        Ok(())
    }
}
