//! One-shot declination backlash measurement.
//!
//! The tool drives the mount north in short pulses until the gear train is
//! demonstrably engaged, steps north at a fixed cadence to measure the clean
//! rate, steps south the same number of times, and hands the recorded
//! trajectory to the analyzer. The result seeds backlash compensation.
//!
//! The run is a per-frame state machine, not a blocking loop: every
//! scheduled pulse is fire and forget, and the machine advances only when
//! the guider delivers the next star position through [`BacklashTool::step`].
//!
//! ```text
//! Initialize -> ClearNorth -> StepNorth -> StepSouth -> TestCorrection
//!                                                            |
//!                 Completed <- Wrapup <------- Restore <-----+
//! ```
//!
//! `Aborted` is reachable from every state, on error or host request. Errors
//! never escape `step`; the host polls `state`, `last_status` and
//! `last_error`.

use crate::analyzer::{backlash_sigma, compute_backlash};
use crate::comp::BacklashComp;
use crate::error::{BltError, MeasurementVerdict};
use crate::stats::RunningStats;
use log::debug;
use mount::{Camera, GuideDirection, GuideFrame, MoveOptions, Point, Scope, SensorSize};

/// Minimum per-step excursion that counts as real movement while clearing, px.
const BACKLASH_EXPECTED_DISTANCE: f64 = 4.0;
/// Consecutive qualifying clearing moves required.
const BACKLASH_MIN_COUNT: i32 = 3;
/// Safety cap on clearing pulses.
const MAX_CLEARING_STEPS: i32 = 100;
/// Cumulative signed clearing travel that exempts the run from strict
/// clearing, px. Reached with small per-step moves it suggests a bad
/// calibration, but the axis has demonstrably moved.
const BACKLASH_EXEMPTION_DISTANCE: f64 = 40.0;
/// Nominal measurement-phase pulse width, ms.
const NORTH_PULSE_SIZE: i32 = 500;
/// Minimum total northward travel, ms.
const MAX_NORTH_PULSES: i32 = 8000;
/// Tolerance for the validation pulse, arc-seconds.
const TRIAL_TOLERANCE_AS: f64 = 2.0;

/// States of a measurement run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BltState {
    /// Record the starting position and size the clearing pulse.
    Initialize,
    /// Pulse north until three consecutive clean moves show engagement.
    ClearNorth,
    /// Fixed-cadence north pulses, recording positions.
    StepNorth,
    /// The same number of south pulses, recording positions.
    StepSouth,
    /// Analyze, then validate the estimate with one south pulse.
    TestCorrection,
    /// Walk back toward the starting position without losing the star.
    Restore,
    /// Disable measurement mode and reset the compensation baseline.
    Wrapup,
    Completed,
    Aborted,
}

/// Flow control inside one `step` call: wait for the next frame, or keep
/// processing in the new state.
enum Flow {
    Wait,
    FallThrough,
}

fn out_of_room(size: SensorSize, x: f64, y: f64, margin: f64) -> bool {
    x < margin || y < margin || x >= size.width as f64 - margin || y >= size.height as f64 - margin
}

/// Declination backlash measurement state machine.
///
/// Instantiated per measurement run; self-contained apart from the
/// collaborators passed into [`step`](Self::step).
pub struct BacklashTool {
    state: BltState,
    last_status: String,
    last_error: Option<BltError>,
    verdict: MeasurementVerdict,
    halt_requested: bool,

    last_dec_guide_rate: f64,
    drift_per_sec: f64,
    pulse_width_ms: i32,
    step_count: i32,
    accepted_moves: i32,
    last_clear_result: f64,
    cum_clearing_distance: f64,
    backlash_exemption: bool,
    north_pulse_count: i32,
    restore_count: i32,

    north_steps: Vec<f64>,
    south_steps: Vec<f64>,
    stats: RunningStats,
    marker: Point,
    starting_point: Point,
    end_south: Point,
    msmt_start_ms: i64,
    msmt_end_ms: i64,

    north_rate: f64,
    backlash_px: f64,
    backlash_ms: i32,
}

impl BacklashTool {
    /// A new run. Refuses to arm if the scope has no valid declination
    /// calibration.
    pub fn new(scope: &impl Scope) -> Self {
        let rate = last_dec_guide_rate(scope);
        let (state, last_status, last_error) = if rate > 0.0 {
            (BltState::Initialize, String::new(), None)
        } else {
            debug!("BLT: could not get calibration data");
            (
                BltState::Aborted,
                "Backlash measurement cannot be run - please re-run your mount calibration"
                    .to_string(),
                Some(BltError::NotCalibrated),
            )
        };

        Self {
            state,
            last_status,
            last_error,
            verdict: MeasurementVerdict::Valid,
            halt_requested: false,
            last_dec_guide_rate: rate,
            drift_per_sec: 0.0,
            pulse_width_ms: 0,
            step_count: 0,
            accepted_moves: 0,
            last_clear_result: 0.0,
            cum_clearing_distance: 0.0,
            backlash_exemption: false,
            north_pulse_count: 0,
            restore_count: 0,
            north_steps: Vec::new(),
            south_steps: Vec::new(),
            stats: RunningStats::new(),
            marker: Point::default(),
            starting_point: Point::default(),
            end_south: Point::default(),
            msmt_start_ms: 0,
            msmt_end_ms: 0,
            north_rate: 0.0,
            backlash_px: 0.0,
            backlash_ms: 0,
        }
    }

    /// Begin a measurement run and drive the first step with the current
    /// guider position. `drift_per_minute` is the declination drift to
    /// correct out of the rate computation, px/min.
    pub fn start_measurement(
        &mut self,
        drift_per_minute: f64,
        scope: &mut impl Scope,
        guider: &mut impl GuideFrame,
        camera: &impl Camera,
        comp: &mut BacklashComp,
        now_ms: i64,
    ) {
        self.state = BltState::Initialize;
        self.last_error = None;
        self.drift_per_sec = drift_per_minute / 60.0;
        self.north_steps.clear();
        self.south_steps.clear();
        self.stats.reset();
        let position = guider.current_position();
        self.step(scope, guider, camera, comp, position, now_ms);
    }

    /// Request a halt. Honored on the next `step`; a pulse already scheduled
    /// will complete but its result is ignored.
    pub fn stop_measurement(&mut self) {
        self.halt_requested = true;
    }

    /// Advance the state machine by one guider frame.
    ///
    /// `current_cam` is the star position in camera coordinates for this
    /// frame and `now_ms` the frame's epoch timestamp in milliseconds.
    pub fn step(
        &mut self,
        scope: &mut impl Scope,
        guider: &mut impl GuideFrame,
        camera: &impl Camera,
        comp: &mut BacklashComp,
        current_cam: Point,
        now_ms: i64,
    ) {
        if self.halt_requested {
            self.halt_requested = false;
            if self.state != BltState::Completed {
                self.last_error = Some(BltError::UserAborted);
                self.state = BltState::Aborted;
            }
        }

        if let Err(err) = self.run(scope, guider, camera, comp, current_cam, now_ms) {
            debug!("BLT: abort in state {:?}: {err}", self.state);
            self.last_error = Some(err);
            self.state = BltState::Aborted;
            self.cleanup(guider, comp);
        }
    }

    fn run(
        &mut self,
        scope: &mut impl Scope,
        guider: &mut impl GuideFrame,
        camera: &impl Camera,
        comp: &mut BacklashComp,
        current_cam: Point,
        now_ms: i64,
    ) -> Result<(), BltError> {
        let curr = scope.transform_camera_to_mount(current_cam)?;

        let mut dec_delta = 0.0;
        if self.state != BltState::Initialize {
            dec_delta = curr.y - self.marker.y;
            self.cum_clearing_distance += dec_delta;
        }

        loop {
            let flow = match self.state {
                BltState::Initialize => self.on_initialize(scope, guider, curr)?,
                BltState::ClearNorth => {
                    self.on_clear_north(scope, guider, camera, current_cam, curr, dec_delta, now_ms)?
                }
                BltState::StepNorth => {
                    self.on_step_north(guider, camera, current_cam, curr, now_ms)?
                }
                BltState::StepSouth => self.on_step_south(guider, curr),
                BltState::TestCorrection => self.on_test_correction(guider, curr, dec_delta)?,
                BltState::Restore => self.on_restore(guider, curr),
                BltState::Wrapup => {
                    self.last_status = "Measurement complete".to_string();
                    self.cleanup(guider, comp);
                    self.state = BltState::Completed;
                    Flow::Wait
                }
                BltState::Completed => Flow::Wait,
                BltState::Aborted => {
                    self.last_status = "Measurement halted".to_string();
                    debug!("BLT: measurement process halted by user or by error");
                    self.cleanup(guider, comp);
                    Flow::Wait
                }
            };
            match flow {
                Flow::Wait => return Ok(()),
                Flow::FallThrough => {}
            }
        }
    }

    fn on_initialize(
        &mut self,
        scope: &mut impl Scope,
        guider: &mut impl GuideFrame,
        curr: Point,
    ) -> Result<Flow, BltError> {
        self.step_count = 0;
        self.marker = curr;
        self.starting_point = curr;
        if self.last_dec_guide_rate <= 0.0 {
            // The user may have calibrated since construction.
            self.last_dec_guide_rate = last_dec_guide_rate(scope);
        }
        if self.last_dec_guide_rate <= 0.0 {
            self.last_status =
                "Backlash measurement cannot be run - Dec guide rate not available".to_string();
            debug!("BLT: could not get calibration data");
            return Err(BltError::NotCalibrated);
        }

        // Clearing pulse from the last known rate, bumped 25% to sidestep
        // near misses against the expected-distance threshold.
        self.pulse_width_ms =
            (BACKLASH_EXPECTED_DISTANCE * 1.25 / self.last_dec_guide_rate) as i32;
        self.accepted_moves = 0;
        self.last_clear_result = 0.0;
        self.cum_clearing_distance = 0.0;
        self.backlash_exemption = false;
        self.verdict = MeasurementVerdict::Valid;
        self.state = BltState::ClearNorth;
        // Measurement results now come to us instead of the guide algorithms.
        guider.enable_measurement_mode(true);
        Ok(Flow::Wait)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_clear_north(
        &mut self,
        scope: &mut impl Scope,
        guider: &mut impl GuideFrame,
        camera: &impl Camera,
        current_cam: Point,
        curr: Point,
        dec_delta: f64,
        now_ms: i64,
    ) -> Result<Flow, BltError> {
        // Want the mount moving north for three consecutive moves of at
        // least the expected distance.
        if self.step_count == 0 {
            debug!(
                "BLT: starting north backlash clearing using pulse width of {}, looking for moves >= {} px",
                self.pulse_width_ms, BACKLASH_EXPECTED_DISTANCE
            );
            guider.schedule_axis_move(GuideDirection::North, self.pulse_width_ms, MoveOptions::NONE);
            self.step_count = 1;
            self.last_status = format!("Clearing North backlash, step {}", self.step_count);
            return Ok(Flow::Wait);
        }

        if dec_delta.abs() >= BACKLASH_EXPECTED_DISTANCE {
            if self.accepted_moves == 0 || self.last_clear_result * dec_delta > 0.0 {
                self.accepted_moves += 1;
                debug!("BLT: accepted clearing move of {dec_delta:.2}");
            } else {
                // Direction reversal: start the count over.
                self.accepted_moves = 0;
                debug!("BLT: rejected clearing move of {dec_delta:.2}, direction reversal");
            }
        } else {
            debug!("BLT: backlash clearing move of {dec_delta:.2} px was not large enough");
        }

        let blocked = out_of_room(
            camera.full_size(),
            current_cam.x,
            current_cam.y,
            guider.max_move_pixels(),
        );

        if self.accepted_moves < BACKLASH_MIN_COUNT {
            if self.step_count < MAX_CLEARING_STEPS {
                if self.cum_clearing_distance.abs() > BACKLASH_EXEMPTION_DISTANCE {
                    // The axis has moved a substantial distance north even
                    // though individual moves stayed small. Proceed before
                    // the star is pushed too far.
                    debug!(
                        "BLT: cumulative clearing distance of {:.2} px is large enough, continuing with measurement",
                        self.cum_clearing_distance
                    );
                    self.backlash_exemption = true;
                } else if !blocked {
                    guider.schedule_axis_move(
                        GuideDirection::North,
                        self.pulse_width_ms,
                        MoveOptions::NONE,
                    );
                    self.step_count += 1;
                    self.marker = curr;
                    self.last_clear_result = dec_delta;
                    self.last_status = format!(
                        "Clearing North backlash, step {} (up to limit of {})",
                        self.step_count, MAX_CLEARING_STEPS
                    );
                    debug!("BLT: {}, last dec delta = {dec_delta:.2} px", self.last_status);
                    return Ok(Flow::Wait);
                }
            } else {
                self.last_status = "Could not clear North backlash - test failed".to_string();
                return Err(BltError::BacklashNotCleared {
                    max_steps: MAX_CLEARING_STEPS,
                });
            }
        }

        if self.accepted_moves >= BACKLASH_MIN_COUNT || self.backlash_exemption || blocked {
            self.state = BltState::StepNorth;
            let total_cleared_ms = (self.step_count * self.pulse_width_ms) as f64;
            // Move at >= 500 ms regardless of image scale, but keep a single
            // pulse under 70% of the tracking rectangle so there is room
            // left for seeing deflections and dec drift.
            self.pulse_width_ms = NORTH_PULSE_SIZE.max(scope.calibration_duration_ms());
            self.pulse_width_ms = self.pulse_width_ms.min(
                (0.7 * guider.max_move_pixels() / self.last_dec_guide_rate).floor() as i32,
            );
            self.step_count = 0;
            // Travel 50% more than the backlash just cleared, or at least 8
            // seconds worth, so the south phase has time to clear its own
            // backlash and actually get moving.
            self.north_pulse_count = ((MAX_NORTH_PULSES + self.pulse_width_ms - 1)
                / self.pulse_width_ms)
                .max((total_cleared_ms * 1.5 / self.pulse_width_ms as f64) as i32);
            debug!("BLT: starting north moves at dec = {:.2}", curr.y);
            self.msmt_start_ms = now_ms;
            return Ok(Flow::FallThrough);
        }

        Ok(Flow::Wait)
    }

    fn on_step_north(
        &mut self,
        guider: &mut impl GuideFrame,
        camera: &impl Camera,
        current_cam: Point,
        curr: Point,
        now_ms: i64,
    ) -> Result<Flow, BltError> {
        let blocked = out_of_room(
            camera.full_size(),
            current_cam.x,
            current_cam.y,
            guider.max_move_pixels(),
        );

        if self.step_count < self.north_pulse_count && !blocked {
            self.last_status = format!(
                "Moving North for {} ms, step {} / {}",
                self.pulse_width_ms,
                self.step_count + 1,
                self.north_pulse_count
            );
            let delta_n = self.record_north_delta(curr, true);
            debug!(
                "BLT: {}, dec location = {:.2}, delta = {delta_n:.2}",
                self.last_status, curr.y
            );
            self.north_steps.push(curr.y);
            guider.schedule_axis_move(GuideDirection::North, self.pulse_width_ms, MoveOptions::NONE);
            self.step_count += 1;
            return Ok(Flow::Wait);
        }

        // Either finished or ran out of room.
        self.msmt_end_ms = now_ms;
        let delta_n = self.record_north_delta(curr, false);
        debug!(
            "BLT: north pulses ended at dec location {:.2}, last delta = {delta_n:.2}",
            curr.y
        );
        self.north_steps.push(curr.y);
        if self.step_count < self.north_pulse_count {
            if (self.step_count as f64) < 0.5 * self.north_pulse_count as f64 {
                self.last_status = "Star too close to edge for accurate measurement of backlash. \
                                    Choose a star farther from the edge."
                    .to_string();
                return Err(BltError::TooFewNorth {
                    completed: self.step_count,
                    planned: self.north_pulse_count,
                });
            }
            debug!("BLT: north pulses truncated, too close to frame edge");
        }
        self.north_pulse_count = self.step_count;
        self.step_count = 0;
        self.state = BltState::StepSouth;
        Ok(Flow::FallThrough)
    }

    /// Delta from the previous north sample, fed to the running stats. The
    /// first sample also pins the marker at the start of the north phase.
    fn record_north_delta(&mut self, curr: Point, pin_marker: bool) -> f64 {
        if self.step_count >= 1 {
            let last = *self
                .north_steps
                .last()
                .expect("north steps recorded for every issued pulse");
            let delta = curr.y - last;
            self.stats.add_delta(delta);
            delta
        } else {
            if pin_marker {
                self.marker = curr;
            }
            0.0
        }
    }

    fn on_step_south(&mut self, guider: &mut impl GuideFrame, curr: Point) -> Flow {
        if self.step_count < self.north_pulse_count {
            self.last_status = format!(
                "Moving South for {} ms, step {} / {}",
                self.pulse_width_ms,
                self.step_count + 1,
                self.north_pulse_count
            );
            debug!("BLT: {}, dec location = {:.2}", self.last_status, curr.y);
            self.south_steps.push(curr.y);
            guider.schedule_axis_move(GuideDirection::South, self.pulse_width_ms, MoveOptions::NONE);
            self.step_count += 1;
            return Flow::Wait;
        }

        debug!("BLT: south pulses ended at dec location {:.2}", curr.y);
        self.south_steps.push(curr.y);
        self.end_south = curr;
        self.state = BltState::TestCorrection;
        self.step_count = 0;
        Flow::FallThrough
    }

    fn on_test_correction(
        &mut self,
        guider: &mut impl GuideFrame,
        curr: Point,
        dec_delta: f64,
    ) -> Result<Flow, BltError> {
        if self.step_count == 0 {
            let estimate = compute_backlash(
                &self.north_steps,
                &self.south_steps,
                self.msmt_start_ms,
                self.msmt_end_ms,
                self.drift_per_sec,
                self.pulse_width_ms,
                self.last_dec_guide_rate,
            );
            self.verdict = estimate.verdict;
            self.backlash_px = estimate.backlash_px;
            self.backlash_ms = estimate.backlash_ms;
            self.north_rate = estimate.north_rate;

            match estimate.verdict {
                MeasurementVerdict::Sanity => {
                    self.last_status = "Dec movements too erratic - test failed".to_string();
                    return Err(BltError::SanityFailure);
                }
                MeasurementVerdict::TooFewSouth => {
                    self.last_status =
                        "Mount never established consistent south moves - test failed".to_string();
                    return Err(BltError::TooFewSouth);
                }
                // Completed but inaccurate; surfaced through the verdict.
                MeasurementVerdict::TooFewNorth => {}
                MeasurementVerdict::Valid => {}
            }

            let (sigma_px, _) = self.backlash_sigma();
            debug!(
                "BLT: trial backlash amount is {:.2} px, {} ms, sigma = {sigma_px:.1} px",
                self.backlash_px, self.backlash_ms
            );

            if self.backlash_ms > 0 {
                if self.backlash_px < guider.max_move_pixels() {
                    // This should land back roughly where the north phase
                    // started, unless the backlash is very large.
                    self.last_status =
                        format!("Issuing test backlash correction of {} ms", self.backlash_ms);
                    debug!("BLT: {}", self.last_status);
                    guider.schedule_axis_move(
                        GuideDirection::South,
                        self.backlash_ms,
                        MoveOptions::NONE,
                    );
                    self.step_count += 1;
                } else {
                    // Clearing pulse would risk losing the star; issue the
                    // largest safe move and skip the validation.
                    let max_frame_move =
                        (guider.max_move_pixels() / self.north_rate).floor() as i32;
                    debug!("BLT: clearing pulse is very large, issuing max south move of {max_frame_move}");
                    guider.schedule_axis_move(
                        GuideDirection::South,
                        max_frame_move,
                        MoveOptions::NONE,
                    );
                    self.state = BltState::Restore;
                }
            } else {
                self.state = BltState::Restore;
                self.step_count = 0;
            }
            return Ok(Flow::Wait);
        }

        // Second entry: see how close the validation pulse came. The
        // outcome is diagnostic only; the measured value stands.
        debug!(
            "BLT: trial backlash pulse resulted in net dec delta = {dec_delta:.2} px, dec location {:.2}",
            curr.y
        );
        let tolerance_px = TRIAL_TOLERANCE_AS / guider.pixel_scale();
        if dec_delta.abs() > tolerance_px {
            let pulse_delta = (curr.y - self.end_south.y).abs();
            let target_delta = (self.marker.y - self.end_south.y).abs();
            if (self.end_south.y - self.marker.y) * dec_delta < 0.0 {
                debug!(
                    "BLT: nominal backlash value over-shot by {:.2}x",
                    target_delta / pulse_delta
                );
            } else {
                debug!(
                    "BLT: nominal backlash value under-shot by {:.2}x",
                    target_delta / pulse_delta
                );
            }
        } else {
            debug!(
                "BLT: nominal backlash pulse resulted in final delta of {:.1} arc-sec",
                dec_delta.abs() * guider.pixel_scale()
            );
        }

        self.state = BltState::Restore;
        self.step_count = 0;
        Ok(Flow::FallThrough)
    }

    fn on_restore(&mut self, guider: &mut impl GuideFrame, curr: Point) -> Flow {
        // Possibly a considerable distance from the start; walk back in
        // steps small enough to keep the star in the frame.
        if self.step_count == 0 {
            debug!(
                "BLT: starting dec position at {:.2}, ending dec position at {:.2}",
                self.marker.y, curr.y
            );
            let amount = (curr.y - self.starting_point.y).abs();
            if amount > guider.max_move_pixels() {
                self.restore_count =
                    ((amount / self.north_rate) / self.pulse_width_ms as f64).floor() as i32;
                debug!(
                    "BLT: final restore distance is {amount:.1} px, approx {} steps",
                    self.restore_count
                );
            } else {
                self.state = BltState::Wrapup;
                return Flow::FallThrough;
            }
        }

        if self.step_count < self.restore_count {
            guider.schedule_axis_move(GuideDirection::South, self.pulse_width_ms, MoveOptions::NONE);
            self.step_count += 1;
            self.last_status = "Restoring star position".to_string();
            debug!(
                "BLT: issuing restore pulse {} of {} ms",
                self.step_count, self.pulse_width_ms
            );
            return Flow::Wait;
        }

        self.state = BltState::Wrapup;
        Flow::FallThrough
    }

    /// Normal guiding is about to resume: stale compensation state must not
    /// be applied to it.
    fn cleanup(&mut self, guider: &mut impl GuideFrame, comp: &mut BacklashComp) {
        comp.reset_baseline();
        guider.enable_measurement_mode(false);
    }

    pub fn state(&self) -> BltState {
        self.state
    }

    /// Human-readable progress or failure text for the host UI.
    pub fn last_status(&self) -> &str {
        &self.last_status
    }

    /// The error that aborted the run, if any.
    pub fn last_error(&self) -> Option<&BltError> {
        self.last_error.as_ref()
    }

    pub fn verdict(&self) -> MeasurementVerdict {
        self.verdict
    }

    /// Measured backlash in pixels.
    pub fn backlash_result_px(&self) -> f64 {
        self.backlash_px
    }

    /// Measured backlash in milliseconds at the empirical north rate.
    pub fn backlash_result_ms(&self) -> i32 {
        self.backlash_ms
    }

    /// Drift-corrected empirical north rate, px/ms.
    pub fn north_rate(&self) -> f64 {
        self.north_rate
    }

    /// Measurement uncertainty as `(sigma_px, sigma_ms)`. Zero unless the
    /// run produced a usable estimate.
    pub fn backlash_sigma(&self) -> (f64, f64) {
        match self.verdict {
            MeasurementVerdict::Valid | MeasurementVerdict::TooFewNorth => {
                backlash_sigma(&self.stats, self.north_rate)
            }
            _ => (0.0, 0.0),
        }
    }

    /// Recorded north-phase dec positions, for plotting.
    pub fn north_steps(&self) -> &[f64] {
        &self.north_steps
    }

    /// Recorded south-phase dec positions, for plotting.
    pub fn south_steps(&self) -> &[f64] {
        &self.south_steps
    }
}

fn last_dec_guide_rate(scope: &impl Scope) -> f64 {
    let calibration = scope.last_calibration();
    if calibration.is_valid {
        calibration.y_rate
    } else {
        -1.0
    }
}
