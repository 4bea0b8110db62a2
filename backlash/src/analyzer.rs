//! Backlash estimation from a measured north/south step trajectory.
//!
//! The goal is a good seed value for backlash compensation, not an accurate
//! characterization of the hardware: the estimate looks at the first south
//! moves and asks when the mount started moving consistently at the rate it
//! showed going north.

use crate::error::MeasurementVerdict;
use crate::stats::RunningStats;
use log::debug;

/// Output of [`compute_backlash`].
#[derive(Debug, Clone, Copy)]
pub struct BacklashEstimate {
    /// Estimated backlash in pixels, clamped to zero from below.
    pub backlash_px: f64,
    /// Estimated backlash in milliseconds at the empirical north rate.
    pub backlash_ms: i32,
    /// Drift-corrected empirical north rate in pixels per millisecond.
    pub north_rate: f64,
    pub verdict: MeasurementVerdict,
}

/// Estimate declination backlash from the recorded step positions.
///
/// `north_steps` and `south_steps` are declination positions sampled once per
/// pulse, mount coordinates, north ascending. `drift_per_sec` is removed from
/// the north travel before the rate is computed, using the measurement
/// bracket `[msmt_start_ms, msmt_end_ms]`. `fallback_rate` is reported when
/// the north data are too thin to compute an empirical rate.
pub fn compute_backlash(
    north_steps: &[f64],
    south_steps: &[f64],
    msmt_start_ms: i64,
    msmt_end_ms: i64,
    drift_per_sec: f64,
    pulse_width_ms: i32,
    fallback_rate: f64,
) -> BacklashEstimate {
    if north_steps.len() <= 3 {
        return BacklashEstimate {
            backlash_px: 0.0,
            backlash_ms: 0,
            north_rate: fallback_rate,
            verdict: MeasurementVerdict::TooFewNorth,
        };
    }

    let mut sorted_north: Vec<f64> = north_steps.windows(2).map(|w| w[1] - w[0]).collect();
    let north_delta: f64 = sorted_north.iter().sum();
    sorted_north.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let step_count = sorted_north.len();
    let drift_amt_px = drift_per_sec * (msmt_end_ms - msmt_start_ms) as f64 / 1000.0;
    let north_rate = ((north_delta - drift_amt_px) / (step_count as f64 * pulse_width_ms as f64)).abs();
    let drift_px_per_frame = drift_amt_px / step_count as f64;
    debug!(
        "BLT: drift correction of {drift_amt_px:.2} px applied to total north movement of {north_delta:.2} px, {drift_px_per_frame:.3} px/frame"
    );
    debug!("BLT: empirical north rate = {:.2} px/s", north_rate * 1000.0);

    // Expect 90% of the median north move. The slack sidesteps mounts whose
    // south rate never quite matches the north rate even though the axis is
    // moving consistently.
    let expected_amount = 0.9 * sorted_north[sorted_north.len() / 2];
    let expected_magnitude = expected_amount.abs();

    let mut early_south_sum = 0.0;
    let mut good_south_moves = 0u32;
    let mut backlash_px = 0.0;
    let mut verdict = MeasurementVerdict::TooFewSouth;

    for step in 1..south_steps.len() {
        let south_move = south_steps[step] - south_steps[step - 1];
        early_south_sum += south_move;
        if south_move.abs() >= expected_magnitude && south_move < 0.0 {
            good_south_moves += 1;
            // Two consecutive qualifying moves rule out a false start south.
            if good_south_moves == 2 {
                let step = step as f64;
                backlash_px =
                    step * expected_magnitude - (early_south_sum - step * drift_px_per_frame).abs();
                verdict = if backlash_px * north_rate < -200.0 {
                    MeasurementVerdict::Sanity
                } else if backlash_px >= 0.7 * north_delta {
                    MeasurementVerdict::TooFewNorth
                } else {
                    MeasurementVerdict::Valid
                };
                if backlash_px < 0.0 {
                    debug!("BLT: negative measurement of {backlash_px:.2} px, forcing to zero");
                    backlash_px = 0.0;
                }
                break;
            }
        } else if good_south_moves > 0 {
            good_south_moves -= 1;
        }
    }

    let backlash_ms = if north_rate > 0.0 {
        (backlash_px / north_rate).round() as i32
    } else {
        0
    };

    BacklashEstimate {
        backlash_px,
        backlash_ms,
        north_rate,
        verdict,
    }
}

/// Uncertainty of the measurement: sigma of the mean for the north moves
/// plus the sigma of the two south measurements, added in quadrature.
///
/// Returns `(sigma_px, sigma_ms)`; zero when fewer than two north deltas
/// were collected.
pub fn backlash_sigma(stats: &RunningStats, north_rate: f64) -> (f64, f64) {
    if stats.count > 1 {
        let sigma_px = (stats.current_ss / stats.count as f64
            + 2.0 * stats.current_ss / (stats.count - 1) as f64)
            .sqrt();
        (sigma_px, sigma_px / north_rate)
    } else {
        (0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// North positions with a constant per-pulse move.
    fn uniform_north(count: usize, per_step: f64) -> Vec<f64> {
        (0..=count).map(|i| i as f64 * per_step).collect()
    }

    #[test]
    fn test_happy_path_estimate() {
        // 20 north deltas of 5 px at 100 ms per pulse: rate 0.05 px/ms.
        let north = uniform_north(20, 5.0);
        // Three dead south pulses, then two moves of 4.5 px.
        let south = vec![100.0, 100.0, 100.0, 100.0, 95.5, 91.0];

        let est = compute_backlash(&north, &south, 0, 40_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::Valid);
        assert_relative_eq!(est.north_rate, 0.05, epsilon = 1e-12);
        // 5 * 0.9*5 - |(-9)| = 13.5 px, 270 ms at 0.05 px/ms.
        assert_relative_eq!(est.backlash_px, 13.5, epsilon = 1e-9);
        assert_eq!(est.backlash_ms, 270);
    }

    #[test]
    fn test_backlash_ms_is_rounded_px_over_rate() {
        let north = uniform_north(10, 5.0);
        let south = vec![50.0, 50.0, 44.9, 39.8];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::Valid);
        assert!(est.backlash_px >= 0.0);
        assert_eq!(
            est.backlash_ms,
            (est.backlash_px / est.north_rate).round() as i32
        );
    }

    #[test]
    fn test_mount_moving_wrong_way_is_too_few_south() {
        let north = vec![0.0, 5.0, 10.0, 15.0, 20.0, 25.0];
        let south = vec![25.0, 40.0, 60.0, 80.0, 100.0, 120.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::TooFewSouth);
        assert_relative_eq!(est.backlash_px, 0.0);
        assert_eq!(est.backlash_ms, 0);
    }

    #[test]
    fn test_short_north_phase_is_too_few_north() {
        let north = vec![0.0, 5.0, 10.0];
        let south = vec![10.0, 5.0, 0.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.031);
        assert_eq!(est.verdict, MeasurementVerdict::TooFewNorth);
        assert_relative_eq!(est.north_rate, 0.031, epsilon = 1e-12);
        assert_eq!(est.backlash_ms, 0);
    }

    #[test]
    fn test_backlash_comparable_to_north_travel_is_suspicious() {
        // Almost the whole north excursion is eaten before south moves start.
        let north = uniform_north(4, 5.0);
        let south = vec![20.0, 20.0, 20.0, 20.0, 20.0, 15.5, 11.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        // 6 * 4.5 - 9 = 18 px against a 20 px north excursion.
        assert_eq!(est.verdict, MeasurementVerdict::TooFewNorth);
    }

    #[test]
    fn test_wildly_negative_estimate_fails_sanity() {
        let north = uniform_north(10, 5.0);
        // Runaway south motion produces a huge negative estimate.
        let south = vec![0.0, -50_000.0, -100_000.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::Sanity);
        // Still clamped for reporting.
        assert_relative_eq!(est.backlash_px, 0.0);
    }

    #[test]
    fn test_false_start_south_decrements_counter() {
        let north = uniform_north(10, 5.0);
        // One good move, then a stall, then two good moves: the stall must
        // reset progress so the estimate lands on the later pair.
        let south = vec![50.0, 45.0, 45.0, 45.0, 40.0, 35.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::Valid);
        // Good pair completes at step 5: 5 * 4.5 - 15 = 7.5 px.
        assert_relative_eq!(est.backlash_px, 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_drift_correction_applied_to_rate() {
        // Same trajectory, but 0.05 px/s of the travel is drift over 100 s.
        let north = uniform_north(20, 5.0);
        let south = vec![100.0, 100.0, 95.5, 91.0];
        let est = compute_backlash(&north, &south, 0, 100_000, 0.05, 100, 0.05);
        // (100 - 5) / (20 * 100)
        assert_relative_eq!(est.north_rate, 0.0475, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_estimate_clamps_to_zero_but_stays_valid() {
        let north = uniform_north(10, 5.0);
        // South moves larger than expected right away: estimate goes negative.
        let south = vec![50.0, 43.0, 36.0];
        let est = compute_backlash(&north, &south, 0, 10_000, 0.0, 100, 0.05);
        assert_eq!(est.verdict, MeasurementVerdict::Valid);
        assert_relative_eq!(est.backlash_px, 0.0);
        assert_eq!(est.backlash_ms, 0);
    }

    #[test]
    fn test_sigma_from_running_stats() {
        let mut stats = RunningStats::new();
        for v in [5.0, 5.2, 4.8, 5.1, 4.9] {
            stats.add_delta(v);
        }
        let (sigma_px, sigma_ms) = backlash_sigma(&stats, 0.05);
        let expected_px = (stats.current_ss / 5.0 + 2.0 * stats.current_ss / 4.0).sqrt();
        assert_relative_eq!(sigma_px, expected_px, epsilon = 1e-12);
        assert_relative_eq!(sigma_ms, expected_px / 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_sigma_needs_two_samples() {
        let mut stats = RunningStats::new();
        stats.add_delta(5.0);
        assert_eq!(backlash_sigma(&stats, 0.05), (0.0, 0.0));
    }
}
