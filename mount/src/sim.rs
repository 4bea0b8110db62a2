//! Simulated mount with a declination backlash dead zone.
//!
//! The simulator models the mechanics the guiding core has to cope with: a
//! gear train that absorbs pulse time after every direction reversal, steady
//! declination drift from imperfect polar alignment, and Gaussian seeing
//! noise on the observed star position. Noise is drawn from a seeded RNG so
//! every run is reproducible.
//!
//! One [`SimMount`] hands out separate [`Scope`], [`GuideFrame`] and
//! [`Camera`] handles that share state, mirroring how a host application
//! wires distinct collaborator objects over one physical mount.

use crate::direction::GuideDirection;
use crate::frame::{Camera, GuideFrame, SensorSize};
use crate::moves::MoveOptions;
use crate::point::Point;
use crate::scope::{Calibration, Scope, TransformError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex};

/// Configuration for the simulated mount.
#[derive(Debug, Clone)]
pub struct SimMountConfig {
    /// Declination guide rate in pixels per millisecond.
    pub y_rate: f64,
    /// Dead zone absorbed after each declination reversal, in milliseconds.
    pub backlash_ms: f64,
    /// Declination drift in pixels per second. Positive drifts north.
    pub drift_px_per_sec: f64,
    /// Standard deviation of seeing noise on the observed position, in pixels.
    pub seeing_sigma_px: f64,
    /// RNG seed for the seeing noise.
    pub seed: u64,
    /// Wall-clock time between frames, in milliseconds.
    pub frame_interval_ms: f64,
    /// Sensor dimensions.
    pub sensor: SensorSize,
    /// Star position at the start of the run, camera coordinates.
    pub star_start: Point,
    /// Guider max-move limit in pixels.
    pub max_move_px: f64,
    /// Image scale in arc-seconds per pixel.
    pub pixel_scale: f64,
    /// Calibration step pulse width in milliseconds.
    pub calibration_duration_ms: i32,
    /// Initial max declination pulse accepted by the driver, in milliseconds.
    pub max_dec_duration_ms: i32,
}

impl Default for SimMountConfig {
    fn default() -> Self {
        Self {
            y_rate: 0.05,
            backlash_ms: 1000.0,
            drift_px_per_sec: 0.0,
            seeing_sigma_px: 0.0,
            seed: 1,
            frame_interval_ms: 2000.0,
            sensor: SensorSize::new(2000, 2000),
            star_start: Point::new(1000.0, 400.0),
            max_move_px: 20.0,
            pixel_scale: 1.5,
            calibration_duration_ms: 750,
            max_dec_duration_ms: 2500,
        }
    }
}

#[derive(Debug)]
struct SimState {
    config: SimMountConfig,
    /// True declination excursion from the starting position, in pixels.
    dec_px: f64,
    /// Direction the declination gear train was last driven.
    engaged: Option<GuideDirection>,
    /// Dead-zone time still to be absorbed before motion resumes, ms.
    clearance_ms: f64,
    pending: Option<(GuideDirection, i32)>,
    elapsed_ms: f64,
    last_position: Point,
    max_dec_duration_ms: i32,
    measurement_mode: bool,
    fail_transform: bool,
    rng: StdRng,
    notifications: Vec<(String, f64)>,
    scheduled: Vec<(GuideDirection, i32, MoveOptions)>,
}

/// Simulated mount. See the module docs for the mechanical model.
#[derive(Clone)]
pub struct SimMount {
    state: Arc<Mutex<SimState>>,
}

impl SimMount {
    pub fn new(config: SimMountConfig) -> Self {
        let last_position = config.star_start;
        let rng = StdRng::seed_from_u64(config.seed);
        let max_dec_duration_ms = config.max_dec_duration_ms;
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                dec_px: 0.0,
                engaged: None,
                clearance_ms: 0.0,
                pending: None,
                elapsed_ms: 0.0,
                last_position,
                max_dec_duration_ms,
                measurement_mode: false,
                fail_transform: false,
                rng,
                notifications: Vec::new(),
                scheduled: Vec::new(),
            })),
        }
    }

    /// Scope driver handle.
    pub fn scope(&self) -> SimScope {
        SimScope {
            state: self.state.clone(),
            class_name: "SimMount".to_string(),
        }
    }

    /// Guider frame loop handle.
    pub fn frame(&self) -> SimFrame {
        SimFrame {
            state: self.state.clone(),
        }
    }

    /// Camera handle.
    pub fn camera(&self) -> SimCamera {
        SimCamera {
            state: self.state.clone(),
        }
    }

    /// Apply the pending pulse, advance one frame interval, and return the
    /// observed star position for the new frame.
    pub fn advance_frame(&self) -> Point {
        let mut state = self.state.lock().expect("sim state mutex poisoned");

        if let Some((dir, ms)) = state.pending.take() {
            if dir.is_dec() {
                if state.engaged != Some(dir) {
                    state.clearance_ms = state.config.backlash_ms;
                }
                let absorbed = state.clearance_ms.min(ms as f64);
                state.clearance_ms -= absorbed;
                let effective_ms = ms as f64 - absorbed;
                let sign = if dir == GuideDirection::North { 1.0 } else { -1.0 };
                state.dec_px += sign * effective_ms * state.config.y_rate;
                state.engaged = Some(dir);
            }
        }

        let interval = state.config.frame_interval_ms;
        state.elapsed_ms += interval;
        state.dec_px += state.config.drift_px_per_sec * interval / 1000.0;

        let noise = if state.config.seeing_sigma_px > 0.0 {
            let normal = Normal::new(0.0, state.config.seeing_sigma_px)
                .expect("seeing sigma is finite and positive");
            normal.sample(&mut state.rng)
        } else {
            0.0
        };

        let observed = Point::new(
            state.config.star_start.x,
            state.config.star_start.y + state.dec_px + noise,
        );
        state.last_position = observed;
        observed
    }

    /// Elapsed simulated wall-clock time in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        self.state.lock().expect("sim state mutex poisoned").elapsed_ms as i64
    }

    /// True declination excursion from the starting position, in pixels.
    pub fn dec_px(&self) -> f64 {
        self.state.lock().expect("sim state mutex poisoned").dec_px
    }

    pub fn measurement_mode(&self) -> bool {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .measurement_mode
    }

    /// Guiding parameter notifications received so far, in order.
    pub fn notifications(&self) -> Vec<(String, f64)> {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .notifications
            .clone()
    }

    /// Every move scheduled so far, in order.
    pub fn scheduled_moves(&self) -> Vec<(GuideDirection, i32, MoveOptions)> {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .scheduled
            .clone()
    }

    /// Force the camera to mount transform to fail, for error-path tests.
    pub fn set_transform_failure(&self, fail: bool) {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .fail_transform = fail;
    }
}

/// [`Scope`] handle over a [`SimMount`].
pub struct SimScope {
    state: Arc<Mutex<SimState>>,
    class_name: String,
}

impl Scope for SimScope {
    fn mount_class_name(&self) -> &str {
        &self.class_name
    }

    fn last_calibration(&self) -> Calibration {
        let state = self.state.lock().expect("sim state mutex poisoned");
        Calibration {
            is_valid: true,
            y_rate: state.config.y_rate,
        }
    }

    fn calibration_duration_ms(&self) -> i32 {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .config
            .calibration_duration_ms
    }

    fn max_dec_duration_ms(&self) -> i32 {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .max_dec_duration_ms
    }

    fn set_max_dec_duration_ms(&mut self, ms: i32) {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .max_dec_duration_ms = ms;
    }

    fn transform_camera_to_mount(&self, camera: Point) -> Result<Point, TransformError> {
        let state = self.state.lock().expect("sim state mutex poisoned");
        if state.fail_transform {
            Err(TransformError)
        } else {
            Ok(camera)
        }
    }
}

/// [`GuideFrame`] handle over a [`SimMount`].
pub struct SimFrame {
    state: Arc<Mutex<SimState>>,
}

impl GuideFrame for SimFrame {
    fn schedule_axis_move(&mut self, direction: GuideDirection, duration_ms: i32, opts: MoveOptions) {
        let mut state = self.state.lock().expect("sim state mutex poisoned");
        state.scheduled.push((direction, duration_ms, opts));
        state.pending = Some((direction, duration_ms));
    }

    fn current_position(&self) -> Point {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .last_position
    }

    fn max_move_pixels(&self) -> f64 {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .config
            .max_move_px
    }

    fn pixel_scale(&self) -> f64 {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .config
            .pixel_scale
    }

    fn enable_measurement_mode(&mut self, enable: bool) {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .measurement_mode = enable;
    }

    fn notify_guiding_param(&mut self, name: &str, value: f64) {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .notifications
            .push((name.to_string(), value));
    }
}

/// [`Camera`] handle over a [`SimMount`].
pub struct SimCamera {
    state: Arc<Mutex<SimState>>,
}

impl Camera for SimCamera {
    fn full_size(&self) -> SensorSize {
        self.state
            .lock()
            .expect("sim state mutex poisoned")
            .config
            .sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pulse_moves_at_guide_rate_once_engaged() {
        let sim = SimMount::new(SimMountConfig {
            backlash_ms: 0.0,
            ..SimMountConfig::default()
        });
        let mut frame = sim.frame();

        frame.schedule_axis_move(GuideDirection::North, 200, MoveOptions::NONE);
        let pos = sim.advance_frame();
        // 200 ms at 0.05 px/ms
        assert_relative_eq!(pos.y - 400.0, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reversal_absorbs_dead_zone() {
        let sim = SimMount::new(SimMountConfig {
            backlash_ms: 300.0,
            ..SimMountConfig::default()
        });
        let mut frame = sim.frame();

        // First pulse engages north: 500 ms pays 300 ms of dead zone.
        frame.schedule_axis_move(GuideDirection::North, 500, MoveOptions::NONE);
        sim.advance_frame();
        assert_relative_eq!(sim.dec_px(), 10.0, epsilon = 1e-9);

        // Same direction again: full pulse moves.
        frame.schedule_axis_move(GuideDirection::North, 100, MoveOptions::NONE);
        sim.advance_frame();
        assert_relative_eq!(sim.dec_px(), 15.0, epsilon = 1e-9);

        // Reversal: 200 ms pulse is swallowed whole by the 300 ms dead zone.
        frame.schedule_axis_move(GuideDirection::South, 200, MoveOptions::NONE);
        sim.advance_frame();
        assert_relative_eq!(sim.dec_px(), 15.0, epsilon = 1e-9);

        // Remaining 100 ms of dead zone, then 100 ms of motion south.
        frame.schedule_axis_move(GuideDirection::South, 200, MoveOptions::NONE);
        sim.advance_frame();
        assert_relative_eq!(sim.dec_px(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_drift_accumulates_per_frame() {
        let sim = SimMount::new(SimMountConfig {
            drift_px_per_sec: 0.5,
            frame_interval_ms: 2000.0,
            ..SimMountConfig::default()
        });
        sim.advance_frame();
        sim.advance_frame();
        assert_relative_eq!(sim.dec_px(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_identical_seeds_produce_identical_trajectories() {
        let config = SimMountConfig {
            seeing_sigma_px: 0.5,
            seed: 99,
            ..SimMountConfig::default()
        };
        let a = SimMount::new(config.clone());
        let b = SimMount::new(config);

        for _ in 0..20 {
            let pa = a.advance_frame();
            let pb = b.advance_frame();
            assert_eq!(pa, pb);
        }
    }

    #[test]
    fn test_transform_failure_toggle() {
        let sim = SimMount::new(SimMountConfig::default());
        let scope = sim.scope();
        assert!(scope.transform_camera_to_mount(Point::new(1.0, 2.0)).is_ok());
        sim.set_transform_failure(true);
        assert!(scope
            .transform_camera_to_mount(Point::new(1.0, 2.0))
            .is_err());
    }
}
