use crate::direction::GuideDirection;
use crate::moves::MoveOptions;
use crate::point::Point;

/// Sensor dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSize {
    pub width: usize,
    pub height: usize,
}

impl SensorSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// Contract for the camera.
pub trait Camera {
    /// Full sensor dimensions.
    fn full_size(&self) -> SensorSize;
}

/// Contract for the guider frame loop.
///
/// Scheduled moves are fire and forget: the caller learns the outcome from
/// the star position delivered with a subsequent frame, never from a
/// completion callback.
pub trait GuideFrame {
    /// Queue a timed pulse on one mount axis.
    fn schedule_axis_move(&mut self, direction: GuideDirection, duration_ms: i32, opts: MoveOptions);

    /// Star position in camera coordinates as of the latest frame.
    fn current_position(&self) -> Point;

    /// Largest single-frame star displacement the guider will chase, in pixels.
    fn max_move_pixels(&self) -> f64;

    /// Image scale in arc-seconds per pixel.
    fn pixel_scale(&self) -> f64;

    /// While enabled, frame results are routed to the measurement consumer
    /// instead of the normal guide algorithms.
    fn enable_measurement_mode(&mut self, enable: bool);

    /// Surface a guiding parameter change to the host.
    fn notify_guiding_param(&mut self, name: &str, value: f64);
}
