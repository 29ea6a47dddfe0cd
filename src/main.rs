use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rhsdaq::hal::mock::{SimulatedDriver, SimulatedOni};
use rhsdaq::recording::StopOutcome;
use rhsdaq::stimulus::StimulusDescriptor;
use rhsdaq::{AcquisitionKernel, DaqConfig};

const CHIPS: u32 = 4;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("rhsdaq - simulated headstage demo");
    println!("=================================\n");

    let config = match std::env::args().nth(1) {
        Some(path) => DaqConfig::load_or_create(&PathBuf::from(path))?,
        None => DaqConfig::default(),
    };
    let sample_rate = config.sample_rate_hz;

    let oni = Arc::new(SimulatedOni::with_headstage(CHIPS));
    let driver = SimulatedDriver::new(oni.clone());
    let mut kernel = AcquisitionKernel::open(config, &driver, oni.clone())
        .await
        .context("Failed to open simulated headstage")?;
    println!("Acquiring from devices {:?} ({} probes)", kernel.device_order(), kernel.num_probes());

    // Biphasic pulse train on electrode 0
    let mut descriptors = vec![StimulusDescriptor::default(); kernel.num_probes()];
    descriptors[0] = StimulusDescriptor::biphasic(18.1, 99.3, 6, 3, 300);
    let report = kernel.stage_stimulus(descriptors)?;
    println!(
        "Staged stimulus: step {} nA, {} lossy amplitude(s)",
        report.step.nanoamps(),
        report.lossy.len()
    );
    let id = kernel.commit_stimulus()?;
    println!("Committed stimulus set {}\n", id);

    oni.start_generator(sample_rate, true);
    kernel.start_acquisition()?;
    let session = kernel.record()?;
    println!("Recording to {:?}", session);

    tokio::time::sleep(Duration::from_secs(2)).await;
    kernel.trigger_stimulus()?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    if let StopOutcome::Recorded(summary) = kernel.stop()? {
        println!(
            "Recorded {} frames, {} stimulus set(s)",
            summary.frames, summary.stimulus_sets
        );
    }
    kernel.recompute_stats();
    kernel.stop_acquisition()?;
    oni.stop_generator();

    if let Some(stats) = kernel.probe_stats().first() {
        println!("Probe 0: mean {:.2} µV, deviation {:.2} µV", stats.mean, stats.deviation);
    }
    let bursts = kernel.burst_snapshot();
    println!(
        "Spikes detected: {} (probe 0 rate {:.1} Hz)\n",
        kernel.spike_total(),
        bursts.rates_hz.first().copied().unwrap_or(0.0)
    );

    println!("Replaying {:?}", session);
    kernel.clear_spikes();
    kernel.play(&session, true)?;
    let status = kernel.playback_status();
    if !kernel.wait_for_playback(Duration::from_secs(10)) {
        println!("Playback still running, stopping it");
        kernel.stop()?;
    }
    if let Some(status) = status {
        println!(
            "Replayed {} frames (drift factor {:.4})",
            status.frames_played.load(Ordering::Relaxed),
            status.drift_factor()
        );
    }
    println!("Spikes detected during replay: {}\n", kernel.spike_total());

    println!("{}", kernel.monitor().generate_report());
    kernel.shutdown()?;
    Ok(())
}
