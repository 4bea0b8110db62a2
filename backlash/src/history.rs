//! Rolling record of backlash compensation events and their follow-up
//! residuals, plus the adaptation policy that decides pulse adjustments.

use log::debug;

/// Events retained before the oldest is evicted.
const HISTORY_DEPTH: usize = 10;
/// Correction tuples per event: the trigger deflection plus two follow-ups.
const ENTRY_CAPACITY: usize = 3;

/// One residual observation: seconds since the history epoch, and the miss.
///
/// A positive miss means the preceding pulse under-shot (more correction of
/// the same sign was still needed); negative means it over-shot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionTuple {
    pub time_seconds: i64,
    pub miss: f64,
}

/// One compensated declination reversal.
///
/// Slot 0 of `corrections` is the deflection that triggered the reversal;
/// slots 1 and 2 are the residuals seen on the following frames. Slot 2 is
/// what makes stiction detectable: an undershoot followed by an overshoot is
/// the signature of static friction releasing late.
#[derive(Debug, Clone)]
pub struct BlcEvent {
    pub corrections: Vec<CorrectionTuple>,
    pub initial_overshoot: bool,
    pub initial_undershoot: bool,
    pub stiction_seen: bool,
}

impl BlcEvent {
    fn new(time_seconds: i64, trigger_deflection: f64) -> Self {
        Self {
            corrections: vec![CorrectionTuple {
                time_seconds,
                miss: trigger_deflection,
            }],
            initial_overshoot: false,
            initial_undershoot: false,
            stiction_seen: false,
        }
    }

    fn add_info(&mut self, time_seconds: i64, amount: f64, min_move: f64) {
        if self.corrections.len() >= ENTRY_CAPACITY {
            return;
        }
        self.corrections.push(CorrectionTuple {
            time_seconds,
            miss: amount,
        });
        if amount.abs() > min_move {
            match self.corrections.len() {
                2 => {
                    if amount > 0.0 {
                        self.initial_undershoot = true;
                    } else {
                        self.initial_overshoot = true;
                    }
                }
                3 => {
                    self.stiction_seen = self.initial_undershoot && amount < 0.0;
                }
                _ => {}
            }
        }
    }
}

/// Summary of the most recent events.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentStats {
    /// Events that did not open with an overshoot (undershoot or inconclusive).
    pub short_count: u32,
    /// Events that opened with an overshoot.
    pub long_count: u32,
    /// Events where stiction was observed.
    pub stiction_count: u32,
    /// Mean slot-1 miss across events with at least two corrections.
    pub avg_initial_miss: f64,
    /// Mean slot-2 miss across events with stiction.
    pub avg_stiction_amount: f64,
}

/// Bounded sequence of [`BlcEvent`]s with a tracking window over the newest.
///
/// The newest event is the only one that accepts follow-up residuals, and
/// only while the window is open. All decision logic works on relative time
/// offsets from the epoch captured at construction.
#[derive(Debug)]
pub struct BlcHistory {
    events: Vec<BlcEvent>,
    window_open: bool,
    time_base: i64,
}

impl BlcHistory {
    /// `time_base` is the wall-clock epoch, in seconds, that all recorded
    /// times are made relative to.
    pub fn new(time_base: i64) -> Self {
        Self {
            events: Vec::new(),
            window_open: false,
            time_base,
        }
    }

    pub fn window_open(&self) -> bool {
        self.window_open
    }

    pub fn close_window(&mut self) {
        self.window_open = false;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[BlcEvent] {
        &self.events
    }

    /// The newest event, the one driving any open window.
    pub fn current(&self) -> Option<&BlcEvent> {
        self.events.last()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        debug!("BLC: history cleared");
    }

    /// Open a new event for a compensated reversal. Evicts the oldest event
    /// when the history is full.
    pub fn record_new(&mut self, when: i64, trigger_deflection: f64) {
        if self.events.len() >= HISTORY_DEPTH {
            self.events.remove(0);
            debug!("BLC: oldest event removed");
        }
        self.events
            .push(BlcEvent::new(when - self.time_base, trigger_deflection));
        self.window_open = true;
    }

    /// Append a follow-up residual to the newest event. Returns false, and
    /// closes the window, if no event is accepting residuals.
    pub fn add_deflection(&mut self, when: i64, amount: f64, min_move: f64) -> bool {
        let time_base = self.time_base;
        let window_open = self.window_open;
        match self.events.last_mut() {
            Some(event) if window_open && event.corrections.len() < ENTRY_CAPACITY => {
                event.add_info(when - time_base, amount, min_move);
                true
            }
            _ => {
                self.window_open = false;
                debug!("BLC: history window closed");
                false
            }
        }
    }

    /// Delete up to `how_many` of the oldest overshoot events, never touching
    /// the newest event since it drives the current decision.
    pub fn remove_oldest_overshoots(&mut self, how_many: usize) {
        for _ in 0..how_many {
            let len = self.events.len();
            if len < 2 {
                break;
            }
            let Some(pos) = self.events[..len - 1]
                .iter()
                .position(|e| e.initial_overshoot)
            else {
                break;
            };
            self.events.remove(pos);
        }
    }

    /// Summarize the newest `depth` events.
    pub fn stats(&self, depth: usize) -> RecentStats {
        let mut results = RecentStats::default();
        let mut miss_sum = 0.0;
        let mut miss_count = 0u32;
        let mut stiction_sum = 0.0;
        for event in self.events.iter().rev().take(depth) {
            if event.initial_overshoot {
                results.long_count += 1;
            } else {
                results.short_count += 1;
            }
            if event.stiction_seen {
                results.stiction_count += 1;
                stiction_sum += event.corrections[2].miss;
            }
            // Only the first residual after each pulse goes into the average.
            if event.corrections.len() > 1 {
                miss_sum += event.corrections[1].miss;
                miss_count += 1;
            }
        }
        if miss_count > 0 {
            results.avg_initial_miss = miss_sum / miss_count as f64;
        }
        if results.stiction_count > 0 {
            results.avg_stiction_amount = stiction_sum / results.stiction_count as f64;
        }
        results
    }

    /// The adaptation policy. Given the latest miss, decide whether the
    /// compensation pulse should change and by how many signed milliseconds.
    ///
    /// Every path closes the tracking window except the undershoot case that
    /// is still waiting for a second follow-up residual.
    pub fn adjustment_needed(&mut self, miss: f64, min_move: f64, y_rate: f64) -> Option<f64> {
        let Some(current) = self.events.last() else {
            return None;
        };
        let stats = self.stats(HISTORY_DEPTH);
        let avg_init_miss = stats.avg_initial_miss;
        debug!(
            "BLC: history state: miss={:.2}, avg_initial_miss={:.2}, short={}, long={}, stiction={}, deflections={:?}",
            miss,
            avg_init_miss,
            stats.short_count,
            stats.long_count,
            stats.stiction_count,
            current
                .corrections
                .iter()
                .map(|c| c.miss)
                .collect::<Vec<_>>()
        );

        if miss.abs() < min_move {
            self.window_open = false;
            debug!("BLC: no correction, miss below min-move, window closed");
            return None;
        }

        let corr = (avg_init_miss.abs() / y_rate).round();
        let entries = current.corrections.len();
        let stiction_seen = current.stiction_seen;

        if miss > 0.0 {
            // Under-shoot: the comp pulse did not cover the dead zone.
            if avg_init_miss <= 0.0 {
                self.window_open = false;
                debug!("BLC: under-shoot, no adjustment, avg miss not positive, window closed");
                return None;
            }
            if entries < ENTRY_CAPACITY {
                debug!("BLC: under-shoot, no adjustment, waiting for more data");
                return None;
            }
            self.window_open = false;
            if stats.stiction_count > 2 {
                debug!("BLC: under-shoot, no adjustment because of stiction history, window closed");
                None
            } else if stats.long_count >= 2 {
                debug!("BLC: under-shoot, no adjustment because of over-shoot history, window closed");
                None
            } else {
                debug!("BLC: under-shoot, nominal increase by {corr}, window closed");
                Some(corr)
            }
        } else {
            // Over-shoot: the comp pulse pushed past the dead zone.
            self.window_open = false;
            if avg_init_miss >= 0.0 && stats.long_count <= stats.short_count && !stiction_seen {
                debug!("BLC: over-shoot, no adjustment, history does not support it, window closed");
                return None;
            }
            if entries == ENTRY_CAPACITY {
                if stiction_seen {
                    if stats.stiction_count > 1 {
                        let stiction_corr = (stats.avg_stiction_amount.abs() / y_rate).round();
                        debug!(
                            "BLC: over-shoot, stiction seen, nominal decrease by {stiction_corr}, window closed"
                        );
                        Some(-stiction_corr)
                    } else {
                        // Seeing plus a low min-move can look like stiction,
                        // so the first sighting gets no reaction.
                        debug!("BLC: over-shoot, first stiction event, no adjustment, window closed");
                        None
                    }
                } else {
                    None
                }
            } else if stats.long_count > stats.short_count && self.events.len() >= 5 {
                self.remove_oldest_overshoots(2);
                debug!("BLC: recent history of over-shoots, nominal decrease by {corr}, window closed");
                Some(-corr)
            } else if avg_init_miss.abs() > min_move {
                debug!("BLC: average miss indicates over-shooting, nominal decrease by {corr}, window closed");
                Some(-corr)
            } else {
                debug!("BLC: over-shoot, no correction because of small average miss, window closed");
                None
            }
        }
    }
}
