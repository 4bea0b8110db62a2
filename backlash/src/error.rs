use mount::TransformError;
use thiserror::Error;

/// Outcome classification from the backlash measurement analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementVerdict {
    /// The estimate is usable as a compensation seed.
    Valid,
    /// The estimate came out a large negative number; the data are erratic.
    Sanity,
    /// The north phase was too short for the estimate to mean much.
    TooFewNorth,
    /// The mount never produced two consecutive south moves of the expected size.
    TooFewSouth,
}

/// Errors that terminate a backlash measurement run.
///
/// These never cross the crate boundary as panics or early returns from
/// `step`; the tool transitions to its aborted state, runs cleanup, and
/// stores the error for the host to poll.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BltError {
    /// No valid declination guide rate is available.
    #[error("declination guide rate not available, re-run mount calibration")]
    NotCalibrated,

    /// The clearing phase never saw three consecutive clean north moves.
    #[error("could not clear north backlash within {max_steps} steps")]
    BacklashNotCleared {
        /// The clearing step limit that was exhausted.
        max_steps: i32,
    },

    /// The north phase was cut short, typically by the frame edge.
    #[error("north measurement truncated after {completed} of {planned} pulses")]
    TooFewNorth {
        /// Pulses actually issued.
        completed: i32,
        /// Pulses planned.
        planned: i32,
    },

    /// The analyzer never saw two consecutive acceptable south moves.
    #[error("mount never established consistent south moves")]
    TooFewSouth,

    /// The analyzer produced a large negative backlash estimate.
    #[error("declination movements too erratic to measure")]
    SanityFailure,

    /// The scope could not map camera coordinates to mount coordinates.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The host requested a halt.
    #[error("measurement halted by user")]
    UserAborted,
}
