use std::sync::Arc;

use rhsdaq::hal::mock::SimulatedOni;
use rhsdaq::hal::registers::rhs2116;
use rhsdaq::hal::ChannelMap;
use rhsdaq::stimulus::{
    build_delta_table, choose_step_size, CommitMode, StepSize, StimulusController, StimulusDescriptor,
    StimulusState,
};
use rhsdaq::{ConfigurationError, DaqError};

fn empty_set(probes: usize) -> Vec<StimulusDescriptor> {
    vec![StimulusDescriptor::default(); probes]
}

#[test]
fn test_reference_step_selection() {
    let mut set = empty_set(16);
    set[0] = StimulusDescriptor::biphasic(18.1, 99.3, 10, 1, 0);

    let report = choose_step_size(&mut set).unwrap();
    assert_eq!(report.step, StepSize::Step500nA);
    assert_eq!(set[0].cathodic_steps, 199);
    assert!((set[0].actual_cathodic_ua - 99.5).abs() < 1e-9);
    assert_eq!(set[0].anodic_steps, 36);
    assert!((set[0].actual_anodic_ua - 18.0).abs() < 1e-9);
    assert!(!report.lossy.is_empty());
}

#[test]
fn test_step_shared_across_devices() {
    // a large amplitude on the second chip coarsens the first chip's step too
    let mut set = empty_set(32);
    set[0] = StimulusDescriptor::biphasic(2.0, 2.0, 4, 1, 0);
    set[20] = StimulusDescriptor::biphasic(400.0, 400.0, 4, 1, 0);

    let report = choose_step_size(&mut set).unwrap();
    assert_eq!(report.step, StepSize::Step2000nA);
    assert_eq!(set[0].anodic_steps, 1);
    assert_eq!(set[20].anodic_steps, 200);
}

#[test]
fn test_unreachable_amplitude() {
    let mut set = empty_set(16);
    set[5] = StimulusDescriptor::biphasic(3000.0, 1.0, 4, 1, 0);
    assert!(matches!(
        choose_step_size(&mut set),
        Err(ConfigurationError::AmplitudeOutOfRange { probe: 5, .. })
    ));
}

#[test]
fn test_table_routes_through_channel_map() {
    let mut set = empty_set(32);
    set[3] = StimulusDescriptor::biphasic(10.0, 10.0, 5, 1, 0);
    let report = choose_step_size(&mut set).unwrap();

    // electrode 3 is wired to probe 19 (second chip, channel 3)
    let mut permutation: Vec<usize> = (0..32).collect();
    permutation.swap(3, 19);
    let map = ChannelMap::from_permutation(permutation).unwrap();

    let program = build_delta_table(&set, report.step, &map, &[256, 257]).unwrap();
    assert!(program.device(256).unwrap().table.is_empty());

    let second = program.device(257).unwrap();
    assert!(!second.table.is_empty());
    let onset = second.table.get(0).unwrap();
    assert_eq!(onset & rhs2116::pol_en_bits(3, true, false), rhs2116::pol_en_bits(3, true, false));
}

#[test]
fn test_overflow_writes_nothing() {
    let oni = SimulatedOni::with_headstage(1);
    let mut controller = StimulusController::new(
        vec![256],
        CommitMode::Verified,
        true,
        Arc::new(StimulusState::new()),
    );

    // 100 repetitions need at least 300 distinct time keys
    let mut set = empty_set(16);
    set[0] = StimulusDescriptor::biphasic(10.0, 10.0, 2, 100, 10);

    let err = controller.stage(set, &ChannelMap::identity(16)).unwrap_err();
    assert!(matches!(
        err,
        DaqError::Configuration(ConfigurationError::DeltaTableOverflow { device: 256, limit: 255, .. })
    ));
    assert!(!controller.has_staged());
    assert!(controller.commit(&oni).is_err());
    assert_eq!(oni.write_count(), 0);
}

#[test]
fn test_commit_programs_registers() {
    let oni = SimulatedOni::with_headstage(1);
    let state = Arc::new(StimulusState::new());
    let mut controller = StimulusController::new(vec![256], CommitMode::Verified, true, state.clone());

    let mut set = empty_set(16);
    set[2] = StimulusDescriptor::biphasic(18.1, 99.3, 10, 1, 0);
    controller.stage(set, &ChannelMap::identity(16)).unwrap();
    let id = controller.commit(&oni).unwrap();

    assert_eq!(id, 0);
    assert_eq!(state.snapshot(), (true, 0));
    let (sel1, sel2, sel3) = StepSize::Step500nA.sel();
    assert_eq!(
        oni.register(256, rhs2116::STEPSZ),
        Some(rhs2116::pack_step_size(sel1, sel2, sel3))
    );
    assert_eq!(oni.register(256, rhs2116::neg_register(2)), Some(rhs2116::pack_magnitude(199)));
    assert_eq!(oni.register(256, rhs2116::pos_register(2)), Some(rhs2116::pack_magnitude(36)));
    // zero dwell merges the phase boundary: onset, phase switch, end
    assert_eq!(oni.register(256, rhs2116::NUMDELTAS), Some(3));
    assert_eq!(oni.register(256, rhs2116::STIM_ARM), Some(1));
}
