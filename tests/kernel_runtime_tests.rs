use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use rhsdaq::hal::mock::{SimulatedDriver, SimulatedOni};
use rhsdaq::recording::{RecordingSession, SessionReader, StopOutcome, TransportState};
use rhsdaq::stimulus::StimulusDescriptor;
use rhsdaq::{AcquisitionKernel, DaqConfig, DaqError, KernelStatus};
use tempfile::tempdir;

fn config(root: &std::path::Path) -> DaqConfig {
    let mut config = DaqConfig::default();
    config.buffers.stats_interval_ms = 20;
    config.recording.root_dir = root.to_path_buf();
    config
}

async fn open(chips: u32, root: &std::path::Path) -> Result<(AcquisitionKernel, Arc<SimulatedOni>)> {
    let oni = Arc::new(SimulatedOni::with_headstage(chips));
    let driver = SimulatedDriver::new(oni.clone());
    let kernel = AcquisitionKernel::open(config(root), &driver, oni.clone()).await?;
    Ok((kernel, oni))
}

#[tokio::test]
async fn test_kernel_runtime_creation() -> Result<()> {
    let root = tempdir()?;
    let (kernel, _) = open(2, root.path()).await?;

    assert_eq!(kernel.status(), KernelStatus::Stopped);
    assert_eq!(kernel.device_order(), &[256, 257]);
    assert_eq!(kernel.num_probes(), 32);
    assert_eq!(kernel.registry().devices().count(), 4);

    let stages: Vec<String> = kernel.metrics().keys().cloned().collect();
    for stage in ["acquisition", "buffers", "player", "recorder", "spikes", "sync"] {
        assert!(stages.contains(&stage.to_string()), "missing stage {}", stage);
    }
    Ok(())
}

#[tokio::test]
async fn test_acquire_record_replay() -> Result<()> {
    let root = tempdir()?;
    let (mut kernel, oni) = open(2, root.path()).await?;

    let mut descriptors = vec![StimulusDescriptor::default(); 32];
    descriptors[4] = StimulusDescriptor::biphasic(18.1, 99.3, 6, 1, 0);
    assert_eq!(kernel.stage_stimulus(descriptors)?.step.nanoamps(), 500);
    assert_eq!(kernel.commit_stimulus()?, 0);

    oni.start_generator(kernel.config().sample_rate_hz, true);
    kernel.start_acquisition()?;
    assert_eq!(kernel.status(), KernelStatus::Running);
    let dir = kernel.record()?;
    assert_eq!(kernel.transport_state(), TransportState::Recording);

    tokio::time::sleep(Duration::from_millis(500)).await;
    kernel.trigger_stimulus()?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let recorded = match kernel.stop()? {
        StopOutcome::Recorded(summary) => summary.frames,
        other => panic!("unexpected {:?}", other),
    };
    kernel.stop_acquisition()?;
    oni.stop_generator();
    assert!(recorded > 1000, "only {} frames recorded", recorded);

    // the simulated spike rides on channel 0 of each chip
    let spikes = kernel.spike_history();
    assert!(spikes.iter().any(|s| s.probe == 0));
    assert!(spikes.iter().any(|s| s.probe == 16));
    assert_eq!(kernel.metrics()["sync"].faults_count, 0);

    let session = RecordingSession::open(&dir)?;
    let mut reader = SessionReader::open(&session)?;
    assert_eq!(reader.frames(), recorded);
    assert_eq!(reader.catalog().len(), 1);
    let mut ids = Vec::new();
    while let Some(frame) = reader.read_frame()? {
        ids.push(frame.stimulus_id);
    }
    // inactive until triggered, then active for the 12-sample biphasic pulse
    assert_eq!(ids[0], -1);
    assert_eq!(ids.iter().filter(|id| **id == 0).count(), 12);
    let onset = ids.iter().position(|id| *id == 0).unwrap();
    assert!(ids[onset..onset + 12].iter().all(|id| *id == 0));

    let before = kernel.buffers().dense_count();
    kernel.play(&dir, false)?;
    assert!(kernel.wait_for_playback(Duration::from_secs(10)));
    assert_eq!(kernel.transport_state(), TransportState::Stopped);
    assert_eq!(kernel.buffers().dense_count() - before, recorded);
    assert_eq!(kernel.metrics()["player"].frames_processed, recorded);
    assert_eq!(kernel.status(), KernelStatus::Stopped);

    kernel.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_playback_and_acquisition_exclude_each_other() -> Result<()> {
    let root = tempdir()?;
    let (mut kernel, oni) = open(1, root.path()).await?;

    oni.start_generator(kernel.config().sample_rate_hz, true);
    kernel.start_acquisition()?;
    let dir = kernel.record()?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(matches!(kernel.play(&dir, false), Err(DaqError::InvalidState(_))));
    assert!(matches!(kernel.add_device(257), Err(DaqError::InvalidState(_))));

    // stopping acquisition also closes the session
    kernel.stop_acquisition()?;
    oni.stop_generator();
    assert_eq!(kernel.transport_state(), TransportState::Stopped);

    kernel.play(&dir, true)?;
    assert!(matches!(kernel.start_acquisition(), Err(DaqError::InvalidState(_))));
    kernel.stop()?;
    assert_eq!(kernel.status(), KernelStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_is_reported() -> Result<()> {
    let root = tempdir()?;
    let (mut kernel, oni) = open(1, root.path()).await?;

    let mut descriptors = vec![StimulusDescriptor::default(); 16];
    descriptors[0] = StimulusDescriptor::biphasic(10.0, 10.0, 4, 1, 0);
    kernel.stage_stimulus(descriptors)?;
    oni.fail_writes_to(256, rhsdaq::hal::registers::rhs2116::NUMDELTAS);

    assert!(matches!(kernel.commit_stimulus(), Err(DaqError::HardwareIo(_))));
    assert_eq!(kernel.committed_stimulus_id(), -1);
    assert!(kernel.last_fault().is_some());
    Ok(())
}
