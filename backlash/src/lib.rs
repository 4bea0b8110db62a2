//! Declination backlash measurement and compensation for telescope
//! auto-guiding.
//!
//! When a mount reverses direction on the declination axis, play in the gear
//! train swallows guide pulses until the gears re-engage. This crate owns
//! both halves of the problem:
//!
//! 1. **Measurement** ([`BacklashTool`]): a one-shot calibration routine
//!    that drives the mount north in short pulses, then south, watches the
//!    image-plane trajectory, and estimates the backlash in pixels and
//!    milliseconds.
//! 2. **Compensation** ([`BacklashComp`]): a runtime loop that injects a
//!    learned extra pulse on every declination reversal, then watches the
//!    next two or three guider residuals to decide whether the pulse should
//!    grow, shrink, or stay put.
//!
//! # Quick Start
//!
//! ```text
//! use backlash::{BacklashComp, BacklashTool, BltState};
//!
//! // Compensation across a guiding session:
//! let mut comp = BacklashComp::new(&mut scope, settings, session_epoch);
//! comp.enable(&mut frame, true);
//!
//! // Before each dec pulse is issued:
//! comp.apply(opts, direction, y_dist, &mut pulse_ms, now_secs);
//!
//! // After each frame's resulting move:
//! comp.track_result(&mut scope, opts, y_dist, min_move, y_rate, now_secs);
//!
//! // One-shot measurement, driven one call per guider frame:
//! let mut tool = BacklashTool::new(&scope);
//! tool.start_measurement(drift_per_min, &mut scope, &mut frame, &camera, &mut comp, now_ms);
//! while !matches!(tool.state(), BltState::Completed | BltState::Aborted) {
//!     let position = wait_for_next_frame();
//!     tool.step(&mut scope, &mut frame, &camera, &mut comp, position, now_ms);
//! }
//! ```
//!
//! # Measurement State Machine
//!
//! ```text
//!  Initialize -> ClearNorth -> StepNorth -> StepSouth -> TestCorrection
//!                                                             |
//!                  Completed <- Wrapup <------- Restore <-----+
//!
//!  (Aborted is reachable from every state, on error or host request.)
//! ```
//!
//! # Integration
//!
//! The crate never owns its collaborators. The scope driver, guider frame
//! loop, and camera are passed into the operations that need them through
//! the `mount` crate's traits, and timestamps arrive with each event, so the
//! whole core is deterministic under test. Everything is single threaded and
//! cooperative: a scheduled pulse is fire and forget, and state machines
//! advance only when the guider delivers the next star position.

pub mod analyzer;
pub mod comp;
pub mod error;
pub mod history;
pub mod stats;
pub mod tool;

pub use crate::analyzer::{compute_backlash, BacklashEstimate};
pub use crate::comp::BacklashComp;
pub use crate::error::{BltError, MeasurementVerdict};
pub use crate::history::{BlcEvent, BlcHistory, CorrectionTuple, RecentStats};
pub use crate::stats::RunningStats;
pub use crate::tool::{BacklashTool, BltState};
