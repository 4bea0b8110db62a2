//! End-to-end backlash measurement runs against the simulated mount.

use backlash::{BacklashComp, BacklashTool, BltError, BltState, MeasurementVerdict};
use mount::{MemorySettings, SimMount, SimMountConfig};

/// Drive the tool one frame at a time until it finishes or the frame limit
/// runs out. Returns the number of frames consumed.
fn drive(sim: &SimMount, tool: &mut BacklashTool, comp: &mut BacklashComp, max_frames: usize) -> usize {
    let mut scope = sim.scope();
    let mut frame = sim.frame();
    let camera = sim.camera();

    let mut frames = 0;
    while !matches!(tool.state(), BltState::Completed | BltState::Aborted) && frames < max_frames {
        let position = sim.advance_frame();
        tool.step(&mut scope, &mut frame, &camera, comp, position, sim.elapsed_ms());
        frames += 1;
    }
    frames
}

fn new_tool_and_comp(sim: &SimMount) -> (BacklashTool, BacklashComp) {
    let mut scope = sim.scope();
    let comp = BacklashComp::new(&mut scope, Box::new(MemorySettings::new()), 0);
    let tool = BacklashTool::new(&scope);
    (tool, comp)
}

fn start(sim: &SimMount, tool: &mut BacklashTool, comp: &mut BacklashComp) {
    let mut scope = sim.scope();
    let mut frame = sim.frame();
    let camera = sim.camera();
    tool.start_measurement(0.0, &mut scope, &mut frame, &camera, comp, sim.elapsed_ms());
}

#[test]
fn test_measurement_happy_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = SimMountConfig {
        backlash_ms: 1500.0,
        ..SimMountConfig::default()
    };
    let sim = SimMount::new(config);
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    assert!(sim.measurement_mode());

    let frames = drive(&sim, &mut tool, &mut comp, 300);
    assert!(
        frames < 300,
        "measurement did not finish, stuck in {:?}: {}",
        tool.state(),
        tool.last_status()
    );
    assert_eq!(tool.state(), BltState::Completed);
    assert_eq!(tool.verdict(), MeasurementVerdict::Valid);
    assert_eq!(tool.last_status(), "Measurement complete");
    assert!(!sim.measurement_mode());

    // Rate recovered to the configured 0.05 px/ms with no noise or drift.
    assert!((tool.north_rate() - 0.05).abs() < 1e-6);

    // The estimate should land within a couple of measurement pulses of the
    // configured dead zone. The pulse width is capped by the max-move limit:
    // 0.7 * 20 px / 0.05 px/ms = 280 ms.
    let err_ms = (tool.backlash_result_ms() - 1500).abs();
    assert!(
        err_ms <= 2 * 280,
        "estimate {} ms too far from configured 1500 ms",
        tool.backlash_result_ms()
    );
    assert!(tool.backlash_result_px() >= 0.0);

    // Step vectors are exposed for plotting and are pulse-per-sample.
    assert!(tool.north_steps().len() > 10);
    assert_eq!(tool.north_steps().len(), tool.south_steps().len());
}

#[test]
fn test_measurement_with_seeing_noise() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = SimMountConfig {
        backlash_ms: 1500.0,
        seeing_sigma_px: 0.2,
        seed: 7,
        ..SimMountConfig::default()
    };
    let sim = SimMount::new(config);
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    let frames = drive(&sim, &mut tool, &mut comp, 300);
    assert!(frames < 300, "noisy measurement did not finish");
    assert_eq!(tool.state(), BltState::Completed);
    assert_eq!(tool.verdict(), MeasurementVerdict::Valid);

    let err_ms = (tool.backlash_result_ms() - 1500).abs();
    assert!(
        err_ms <= 600,
        "noisy estimate {} ms too far from configured 1500 ms",
        tool.backlash_result_ms()
    );

    // With real scatter in the north deltas the sigma must be reported.
    let (sigma_px, sigma_ms) = tool.backlash_sigma();
    assert!(sigma_px > 0.0);
    assert!(sigma_ms > 0.0);
}

#[test]
fn test_clearing_gives_up_on_excessive_backlash() {
    let _ = env_logger::builder().is_test(true).try_init();

    // The dead zone dwarfs anything 100 clearing pulses can chew through.
    let config = SimMountConfig {
        backlash_ms: 60_000.0,
        ..SimMountConfig::default()
    };
    let sim = SimMount::new(config);
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    drive(&sim, &mut tool, &mut comp, 300);

    assert_eq!(tool.state(), BltState::Aborted);
    assert!(matches!(
        tool.last_error(),
        Some(BltError::BacklashNotCleared { .. })
    ));
    assert!(!sim.measurement_mode());
}

#[test]
fn test_stop_measurement_aborts_on_next_step() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sim = SimMount::new(SimMountConfig::default());
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    drive(&sim, &mut tool, &mut comp, 5);
    assert!(sim.measurement_mode());

    tool.stop_measurement();
    drive(&sim, &mut tool, &mut comp, 1);

    assert_eq!(tool.state(), BltState::Aborted);
    assert_eq!(tool.last_error(), Some(&BltError::UserAborted));
    assert_eq!(tool.last_status(), "Measurement halted");
    assert!(!sim.measurement_mode());
}

#[test]
fn test_transform_failure_aborts_run() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sim = SimMount::new(SimMountConfig::default());
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    drive(&sim, &mut tool, &mut comp, 5);

    sim.set_transform_failure(true);
    drive(&sim, &mut tool, &mut comp, 1);

    assert_eq!(tool.state(), BltState::Aborted);
    assert!(matches!(tool.last_error(), Some(BltError::Transform(_))));
    assert!(!sim.measurement_mode());
}

#[test]
fn test_small_backlash_issues_validation_pulse() {
    let _ = env_logger::builder().is_test(true).try_init();

    // A dead zone small enough that the implied clearing pulse cannot push
    // the star out of the tracking rectangle: the tool validates its
    // estimate with one south pulse of the measured duration.
    let config = SimMountConfig {
        backlash_ms: 200.0,
        ..SimMountConfig::default()
    };
    let sim = SimMount::new(config);
    let (mut tool, mut comp) = new_tool_and_comp(&sim);

    start(&sim, &mut tool, &mut comp);
    let frames = drive(&sim, &mut tool, &mut comp, 300);
    assert!(frames < 300, "measurement did not finish");
    assert_eq!(tool.state(), BltState::Completed);
    assert_eq!(tool.verdict(), MeasurementVerdict::Valid);
    assert!(tool.backlash_result_ms() > 0);

    // The validation pulse went out south at exactly the measured duration.
    let validation = sim
        .scheduled_moves()
        .iter()
        .any(|&(dir, ms, _)| dir == mount::GuideDirection::South && ms == tool.backlash_result_ms());
    assert!(validation, "no validation pulse of the measured duration was scheduled");
}

#[test]
fn test_measurement_with_drift() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 0.1 px/s of north drift: the drift correction keeps the rate honest.
    let config = SimMountConfig {
        backlash_ms: 1500.0,
        drift_px_per_sec: 0.1,
        ..SimMountConfig::default()
    };
    let sim = SimMount::new(config);
    let mut scope = sim.scope();
    let mut frame = sim.frame();
    let camera = sim.camera();
    let mut comp = BacklashComp::new(&mut scope, Box::new(MemorySettings::new()), 0);
    let mut tool = BacklashTool::new(&scope);

    // Drift is supplied per minute.
    tool.start_measurement(6.0, &mut scope, &mut frame, &camera, &mut comp, sim.elapsed_ms());
    let frames = drive(&sim, &mut tool, &mut comp, 300);
    assert!(frames < 300, "drifting measurement did not finish");
    assert_eq!(tool.state(), BltState::Completed);
    assert!((tool.north_rate() - 0.05).abs() < 0.005);
}
