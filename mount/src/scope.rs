use crate::point::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of the most recent mount calibration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Calibration {
    /// False until a calibration has completed successfully.
    pub is_valid: bool,
    /// Declination guide rate in pixels per millisecond.
    pub y_rate: f64,
}

impl Calibration {
    /// A calibration record that reports "not calibrated".
    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            y_rate: 0.0,
        }
    }
}

/// The camera to mount coordinate transform could not be computed,
/// typically because no calibration is available.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("camera to mount coordinate transform failed")]
pub struct TransformError;

/// Contract for the scope driver.
pub trait Scope {
    /// Stable identifier for the mount class, used to key persisted settings.
    fn mount_class_name(&self) -> &str;

    /// The most recent calibration record.
    fn last_calibration(&self) -> Calibration;

    /// Pulse width used during calibration, in milliseconds.
    fn calibration_duration_ms(&self) -> i32;

    /// Longest declination pulse the driver will accept, in milliseconds.
    fn max_dec_duration_ms(&self) -> i32;

    fn set_max_dec_duration_ms(&mut self, ms: i32);

    /// Map a camera plane position into mount coordinates.
    fn transform_camera_to_mount(&self, camera: Point) -> Result<Point, TransformError>;
}
