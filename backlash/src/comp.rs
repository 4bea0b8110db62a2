//! Runtime backlash compensation.
//!
//! On every declination direction reversal a learned extra pulse is folded
//! into the outgoing guide command, then the next two or three guider
//! residuals are recorded into [`BlcHistory`]. When a tracking window fills,
//! the history decides whether the pulse should grow, shrink, or stay.

use crate::history::BlcHistory;
use log::debug;
use mount::{GuideDirection, GuideFrame, MoveOptions, Scope, SettingsStore};

/// Smallest usable compensation pulse in milliseconds. Small enough that the
/// floor can effectively disable compensation.
const MIN_COMP_AMOUNT: i32 = 20;
/// Largest compensation pulse in milliseconds.
const MAX_COMP_AMOUNT: i32 = 8000;

/// Declination backlash compensator.
///
/// Lives for the duration of a mount session. The pulse width, adjustment
/// bounds, and enable flag are loaded from the settings store at construction
/// and written back on every change, keyed by the mount class name.
pub struct BacklashComp {
    history: BlcHistory,
    settings: Box<dyn SettingsStore>,
    mount_class: String,
    pulse_width_ms: i32,
    floor_ms: i32,
    ceiling_ms: i32,
    fixed_size: bool,
    active: bool,
    last_direction: GuideDirection,
}

impl BacklashComp {
    /// Largest pulse `set_pulse` will accept, in milliseconds.
    pub const fn pulse_max_ms() -> i32 {
        MAX_COMP_AMOUNT
    }

    /// Smallest non-zero pulse floor, in milliseconds.
    pub const fn pulse_min_ms() -> i32 {
        MIN_COMP_AMOUNT
    }

    /// Load persisted compensation state for the scope's mount class.
    ///
    /// `time_base_secs` is the wall-clock epoch the event history records
    /// relative times against.
    pub fn new(scope: &mut impl Scope, settings: Box<dyn SettingsStore>, time_base_secs: i64) -> Self {
        let mount_class = scope.mount_class_name().to_string();
        let key = |leaf: &str| format!("/{mount_class}/{leaf}");
        let last_amount = settings.get_int(&key("DecBacklashPulse"), 0);
        let last_floor = settings.get_int(&key("DecBacklashFloor"), 0);
        let last_ceiling = settings.get_int(&key("DecBacklashCeiling"), 0);
        let active = if last_amount > 0 {
            settings.get_bool(&key("DecCompEnabled"), false)
        } else {
            false
        };

        let mut comp = Self {
            history: BlcHistory::new(time_base_secs),
            settings,
            mount_class,
            pulse_width_ms: 0,
            floor_ms: MIN_COMP_AMOUNT,
            ceiling_ms: MAX_COMP_AMOUNT,
            fixed_size: false,
            active,
            last_direction: GuideDirection::None,
        };
        comp.set_comp_values(scope, last_amount, last_floor, last_ceiling);
        if comp.active {
            debug!(
                "BLC: enabled with correction = {} ms, floor = {}, ceiling = {}, {}",
                comp.pulse_width_ms,
                comp.floor_ms,
                comp.ceiling_ms,
                if comp.fixed_size { "fixed" } else { "adjustable" }
            );
        } else {
            debug!("BLC: backlash compensation is disabled");
        }
        comp
    }

    fn key(&self, leaf: &str) -> String {
        format!("/{}/{leaf}", self.mount_class)
    }

    /// Clamp and reconcile the comp values, and widen the scope's max
    /// declination duration if the pulse would not fit.
    fn set_comp_values(&mut self, scope: &mut impl Scope, requested_ms: i32, floor: i32, ceiling: i32) {
        self.pulse_width_ms = requested_ms.clamp(0, MAX_COMP_AMOUNT);
        self.floor_ms = if floor > self.pulse_width_ms || floor < MIN_COMP_AMOUNT {
            MIN_COMP_AMOUNT
        } else {
            floor
        };
        self.ceiling_ms = if ceiling < self.pulse_width_ms {
            ((1.5 * self.pulse_width_ms as f64) as i32).min(MAX_COMP_AMOUNT)
        } else {
            ceiling.min(MAX_COMP_AMOUNT)
        };
        self.fixed_size = (self.ceiling_ms - self.floor_ms).abs() < MIN_COMP_AMOUNT;
        if self.pulse_width_ms > scope.max_dec_duration_ms() && self.active {
            scope.set_max_dec_duration_ms(self.pulse_width_ms);
        }
    }

    /// Request a new set of compensation values. A ceiling of zero (or any
    /// value below the pulse) means compute the default of 1.5x the pulse.
    ///
    /// A change of more than 100 ms invalidates the event history: the old
    /// records describe a different pulse.
    pub fn set_pulse(
        &mut self,
        scope: &mut impl Scope,
        frame: &mut impl GuideFrame,
        ms: i32,
        floor: i32,
        ceiling: i32,
    ) {
        if self.pulse_width_ms != ms || self.floor_ms != floor || self.ceiling_ms != ceiling {
            let old_pulse = self.pulse_width_ms;
            self.set_comp_values(scope, ms, floor, ceiling);
            frame.notify_guiding_param("Backlash comp amount", self.pulse_width_ms as f64);
            debug!(
                "BLC: comp pulse set to {} ms, floor = {} ms, ceiling = {} ms, {}",
                self.pulse_width_ms,
                self.floor_ms,
                self.ceiling_ms,
                if self.fixed_size { "fixed" } else { "adjustable" }
            );
            if (self.pulse_width_ms - old_pulse).abs() > 100 {
                self.history.clear();
                self.history.close_window();
            }
        }

        self.settings
            .set_int(&self.key("DecBacklashPulse"), self.pulse_width_ms);
        self.settings
            .set_int(&self.key("DecBacklashFloor"), self.floor_ms);
        self.settings
            .set_int(&self.key("DecBacklashCeiling"), self.ceiling_ms);
    }

    /// Master enable. Notifies the host only on an actual transition.
    pub fn enable(&mut self, frame: &mut impl GuideFrame, enable: bool) {
        if self.active != enable {
            frame.notify_guiding_param("Backlash comp enabled", if enable { 1.0 } else { 0.0 });
            self.active = enable;
            if enable {
                self.reset_baseline();
            }
        }
        self.settings.set_bool(&self.key("DecCompEnabled"), enable);
        debug!(
            "BLC: backlash comp {}, comp pulse = {} ms",
            if enable { "enabled" } else { "disabled" },
            self.pulse_width_ms
        );
    }

    /// Forget the last commanded direction and close any tracking window.
    ///
    /// Called after any move that bypasses the algorithm (calibration,
    /// dither recovery) so stale direction state is never applied.
    pub fn reset_baseline(&mut self) {
        if self.active {
            self.last_direction = GuideDirection::None;
            self.history.close_window();
            debug!("BLC: last direction was reset");
        }
    }

    /// Possibly fold the compensation pulse into a pending declination move.
    ///
    /// Called before every declination pulse is sent. `y_dist` is the
    /// deflection driving the move and `y_amount` the pulse about to be
    /// issued, in milliseconds. `when_secs` timestamps any event opened.
    pub fn apply(
        &mut self,
        opts: MoveOptions,
        dir: GuideDirection,
        y_dist: f64,
        y_amount: &mut i32,
        when_secs: i64,
    ) {
        if !self.active || self.pulse_width_ms <= 0 || y_dist == 0.0 {
            return;
        }
        let is_algo_result = opts.contains(MoveOptions::ALGO_RESULT);

        if self.last_direction != GuideDirection::None && dir != self.last_direction {
            *y_amount += self.pulse_width_ms;
            if is_algo_result {
                // Only algorithm-driven pulses get outcome tracking.
                self.history.record_new(when_secs, y_dist);
            } else {
                self.history.close_window();
                debug!("BLC: compensation needed for non-algo type move");
            }
            debug!(
                "BLC: dec direction reversal from {} to {}, backlash comp pulse of {} applied",
                self.last_direction, dir, self.pulse_width_ms
            );
        } else if !is_algo_result {
            debug!("BLC: non-algo type move will not reverse dec direction, no comp applied");
        }

        self.last_direction = dir;
    }

    /// Feed the outcome of the latest issued move back into the learner.
    ///
    /// Called after each guider frame's resulting move. Moves that bypass
    /// compensation reset the baseline; non-algorithm moves inside a tracking
    /// window merely close it.
    pub fn track_result(
        &mut self,
        scope: &mut impl Scope,
        opts: MoveOptions,
        y_dist: f64,
        min_move: f64,
        y_rate: f64,
        when_secs: i64,
    ) {
        if !self.active {
            return;
        }
        if !opts.contains(MoveOptions::USE_BLC) {
            // A calibration-type move can shift the mount in dec without
            // telling us about direction.
            self.reset_baseline();
            return;
        }
        if !opts.contains(MoveOptions::ALGO_RESULT) {
            // A non-algo move occurred before follow-up data were acquired.
            self.history.close_window();
            return;
        }
        if self.history.window_open() && !self.fixed_size {
            self.track_inner(scope, y_dist, min_move, y_rate, when_secs);
        }
    }

    /// The learning step: record the residual and apply any adjustment the
    /// history calls for, rate limited and clamped to the adjustment rails.
    fn track_inner(
        &mut self,
        scope: &mut impl Scope,
        y_dist: f64,
        min_move: f64,
        y_rate: f64,
        when_secs: i64,
    ) {
        // Sign convention has nothing to do with north or south, only
        // whether more correction (+) or less (-) was indicated.
        let dir = if y_dist > 0.0 {
            GuideDirection::South
        } else {
            GuideDirection::North
        };
        let magnitude = y_dist.abs();
        let miss = if dir == self.last_direction {
            magnitude
        } else {
            -magnitude
        };
        // Algorithms with no min-move report -1.
        let min_move = min_move.max(0.0);

        self.history.add_deflection(when_secs, miss, min_move);
        let Some(adjustment) = self.history.adjustment_needed(miss, min_move, y_rate) else {
            return;
        };

        let nominal = self.pulse_width_ms as f64 + adjustment;
        let new_pulse = if nominal > self.pulse_width_ms as f64 {
            let capped = (self.pulse_width_ms as f64 * 1.1).min(nominal).round() as i32;
            if capped > self.ceiling_ms {
                debug!("BLC: pulse increase limited by ceiling of {}", self.ceiling_ms);
                self.ceiling_ms
            } else {
                capped
            }
        } else {
            let capped = (self.pulse_width_ms as f64 * 0.8).max(nominal).round() as i32;
            if capped < self.floor_ms {
                debug!("BLC: pulse decrease limited by floor of {}", self.floor_ms);
                self.floor_ms
            } else {
                capped
            }
        };

        debug!("BLC: pulse adjusted to {new_pulse}");
        self.settings
            .set_int(&self.key("DecBacklashPulse"), new_pulse);
        // Reconcile without the public setter: the history this adjustment
        // came from must survive.
        self.set_comp_values(scope, new_pulse, self.floor_ms, self.ceiling_ms);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pulse_width_ms(&self) -> i32 {
        self.pulse_width_ms
    }

    /// The `(pulse, floor, ceiling)` triple, milliseconds.
    pub fn comp_settings(&self) -> (i32, i32, i32) {
        (self.pulse_width_ms, self.floor_ms, self.ceiling_ms)
    }

    /// True when the rails leave no room to adapt.
    pub fn fixed_size(&self) -> bool {
        self.fixed_size
    }

    pub fn last_direction(&self) -> GuideDirection {
        self.last_direction
    }

    /// Read-only view of the event history.
    pub fn history(&self) -> &BlcHistory {
        &self.history
    }
}
