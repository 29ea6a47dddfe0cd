use crossbeam_channel::{select, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::worker::Worker;
use crate::buffers::{ProbeStatistics, RingBufferEngine};
use crate::config::DaqConfig;
use crate::error::{ConfigurationError, DaqError, DaqResult};
use crate::hal::registers::{fmc, heartbeat, rhs2116};
use crate::hal::{DeviceKind, DeviceRegistry, HardwareDriver, OniContext};
use crate::observability::{KernelMonitor, MetricsCollector, MetricsSnapshot, StageMetrics};
use crate::recording::{PlaybackStatus, RecorderPlayer, SessionMetadata, StopOutcome, TransportState};
use crate::spikes::{BurstSnapshot, Spike, SpikeDetector, SpikeStore};
use crate::stimulus::{StepReport, StimulusController, StimulusDescriptor, StimulusState};
use crate::sync::{IngestOutcome, MultiDeviceSynchronizer};

const READ_TIMEOUT: Duration = Duration::from_millis(10);
const FAULT_BACKOFF: Duration = Duration::from_millis(5);
const SPIKE_POLL: Duration = Duration::from_millis(100);

/// Kernel status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelStatus {
    Stopped,
    Initializing,
    Running,
    Error,
}

/// Everything that depends on the acquisition device order
struct Pipeline {
    synchronizer: Arc<Mutex<MultiDeviceSynchronizer>>,
    buffers: Arc<RingBufferEngine>,
    spikes: Arc<Mutex<SpikeStore>>,
    stimulus: StimulusController,
    transport: RecorderPlayer,
}

struct StageHandles {
    sync: Arc<StageMetrics>,
    buffers: Arc<StageMetrics>,
    spikes: Arc<StageMetrics>,
    recorder: Arc<StageMetrics>,
    player: Arc<StageMetrics>,
    acquisition: Arc<StageMetrics>,
}

impl StageHandles {
    fn register(collector: &mut MetricsCollector) -> Self {
        Self {
            sync: collector.stage("sync"),
            buffers: collector.stage("buffers"),
            spikes: collector.stage("spikes"),
            recorder: collector.stage("recorder"),
            player: collector.stage("player"),
            acquisition: collector.stage("acquisition"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The acquisition context object.
///
/// Owns the device registry and every processing component, wires the
/// synchronizer to the sample buffers and the recorder, and runs the
/// acquisition, statistics and spike workers. All UI-facing operations go
/// through here.
pub struct AcquisitionKernel {
    config: DaqConfig,
    context: Arc<dyn OniContext>,
    registry: DeviceRegistry,
    device_order: Vec<u32>,
    stimulus_state: Arc<StimulusState>,
    pipeline: Pipeline,
    collector: MetricsCollector,
    stages: StageHandles,
    acquisition: Option<Worker>,
    analysis: Vec<Worker>,
    status: KernelStatus,
    last_fault: Arc<Mutex<Option<String>>>,
}

impl AcquisitionKernel {
    /// Create a kernel over an open context; no devices are registered yet
    pub fn new(config: DaqConfig, context: Arc<dyn OniContext>) -> DaqResult<Self> {
        let registry = DeviceRegistry::new(context.device_table());
        Self::with_registry(config, context, registry)
    }

    /// Discover the device table through `driver` and register every
    /// device it reports
    pub async fn open(
        config: DaqConfig,
        driver: &dyn HardwareDriver,
        context: Arc<dyn OniContext>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let table = driver.discover_devices().await?;
        info!("Driver '{}' reported {} devices", driver.driver_id(), table.len());

        let mut registry = DeviceRegistry::new(table);
        let added = registry.add_all(config.recording.heartbeat_hz);
        debug!("Registered devices {:?}", added);
        Ok(Self::with_registry(config, context, registry)?)
    }

    fn with_registry(config: DaqConfig, context: Arc<dyn OniContext>, registry: DeviceRegistry) -> DaqResult<Self> {
        let mut collector = MetricsCollector::new();
        let stages = StageHandles::register(&mut collector);
        let stimulus_state = Arc::new(StimulusState::new());
        let device_order = registry.rhs2116_indices();
        let pipeline = Self::build_pipeline(&config, &device_order, &stimulus_state, &stages)?;

        Ok(Self {
            config,
            context,
            registry,
            device_order,
            stimulus_state,
            pipeline,
            collector,
            stages,
            acquisition: None,
            analysis: Vec::new(),
            status: KernelStatus::Stopped,
            last_fault: Arc::new(Mutex::new(None)),
        })
    }

    fn build_pipeline(
        config: &DaqConfig,
        device_order: &[u32],
        stimulus_state: &Arc<StimulusState>,
        stages: &StageHandles,
    ) -> DaqResult<Pipeline> {
        let mut sync = MultiDeviceSynchronizer::new(
            device_order.to_vec(),
            config.hub_clock_hz,
            stimulus_state.clone(),
            stages.sync.clone(),
        );
        let num_probes = sync.num_probes();
        let buffers = Arc::new(RingBufferEngine::new(num_probes, &config.buffers, stages.buffers.clone())?);
        sync.subscribe(buffers.clone());
        let synchronizer = Arc::new(Mutex::new(sync));

        let stimulus = StimulusController::new(
            device_order.to_vec(),
            config.stimulus.commit_mode,
            config.stimulus.atomic_commit,
            stimulus_state.clone(),
        );
        let transport = RecorderPlayer::new(
            config.recording.clone(),
            synchronizer.clone(),
            stimulus_state.clone(),
            stimulus.library(),
            stages.recorder.clone(),
            stages.player.clone(),
        );

        Ok(Pipeline {
            synchronizer,
            buffers,
            spikes: Arc::new(Mutex::new(SpikeStore::new(num_probes, config.sample_rate_hz, &config.spikes))),
            stimulus,
            transport,
        })
    }

    fn ensure_idle(&mut self, action: &str) -> DaqResult<()> {
        if self.acquisition.is_some() || self.pipeline.transport.state() != TransportState::Stopped {
            return Err(DaqError::InvalidState(format!("cannot {} while running", action)));
        }
        Ok(())
    }

    fn set_device_order(&mut self, order: Vec<u32>) -> DaqResult<()> {
        if order == self.device_order {
            return Ok(());
        }
        let pipeline = Self::build_pipeline(&self.config, &order, &self.stimulus_state, &self.stages)?;
        self.stimulus_state.clear();
        self.pipeline = pipeline;
        info!("Acquiring from devices {:?} ({} probes)", order, order.len() * crate::hal::RHS2116_CHANNELS);
        self.device_order = order;
        Ok(())
    }

    pub fn status(&self) -> KernelStatus {
        self.status
    }

    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn device_order(&self) -> &[u32] {
        &self.device_order
    }

    pub fn num_probes(&self) -> usize {
        lock(&self.pipeline.synchronizer).num_probes()
    }

    /// Register one device from the device table. Chips join the
    /// acquisition order, which resets the channel map to identity.
    pub fn add_device(&mut self, device_index: u32) -> DaqResult<DeviceKind> {
        self.ensure_idle("add devices")?;
        let kind = self
            .registry
            .add_device(device_index, self.config.recording.heartbeat_hz)?
            .kind
            .clone();
        if kind.streams_samples() {
            self.set_device_order(self.registry.rhs2116_indices())?;
        }
        Ok(kind)
    }

    /// Acquire and stimulate through `members`, in that order
    pub fn set_acquisition_group(&mut self, members: Vec<u32>) -> DaqResult<u32> {
        self.ensure_idle("regroup devices")?;
        let multi = self.registry.add_multi(members.clone())?;
        self.registry.add_stim(members.clone())?;
        self.set_device_order(members)?;
        Ok(multi)
    }

    pub fn channel_map(&self) -> Vec<usize> {
        lock(&self.pipeline.synchronizer).channel_map().as_slice().to_vec()
    }

    /// Replace the probe-to-electrode map as a whole
    pub fn set_channel_map(&mut self, permutation: Vec<usize>) -> DaqResult<()> {
        if self.pipeline.transport.state() != TransportState::Stopped {
            return Err(DaqError::InvalidState("cannot remap channels during a session".to_string()));
        }
        lock(&self.pipeline.synchronizer).set_channel_map(permutation)?;
        Ok(())
    }

    /// Electrode-to-probe map
    pub fn inverse_channel_map(&self) -> Vec<usize> {
        lock(&self.pipeline.synchronizer).channel_map().inverse().to_vec()
    }

    /// Quantize and compile one descriptor per electrode; nothing is written
    pub fn stage_stimulus(&mut self, descriptors: Vec<StimulusDescriptor>) -> DaqResult<StepReport> {
        let map = lock(&self.pipeline.synchronizer).channel_map().clone();
        self.pipeline.stimulus.stage(descriptors, &map)
    }

    /// Write the staged stimulus to the chips; returns its library id
    pub fn commit_stimulus(&mut self) -> DaqResult<i32> {
        let result = self.pipeline.stimulus.commit(self.context.as_ref());
        if let Err(e) = &result {
            error!("Stimulus commit failed: {}", e);
            *lock(&self.last_fault) = Some(e.to_string());
        }
        result
    }

    pub fn trigger_stimulus(&self) -> DaqResult<()> {
        self.pipeline.stimulus.trigger(self.context.as_ref())
    }

    pub fn committed_stimulus_id(&self) -> i32 {
        self.pipeline.stimulus.committed_id()
    }

    /// Configure the headstage and start streaming frames
    pub fn start_acquisition(&mut self) -> DaqResult<()> {
        if self.acquisition.is_some() {
            return Err(DaqError::InvalidState("acquisition already running".to_string()));
        }
        if self.device_order.is_empty() {
            return Err(ConfigurationError::Buffer("no acquisition devices registered".to_string()).into());
        }
        let transport = self.pipeline.transport.state();
        if matches!(transport, TransportState::Playing | TransportState::Paused) {
            return Err(DaqError::InvalidState("cannot acquire during playback".to_string()));
        }

        self.status = KernelStatus::Initializing;
        if let Err(e) = self.configure_devices(true) {
            self.status = KernelStatus::Error;
            *lock(&self.last_fault) = Some(e.to_string());
            return Err(e);
        }
        lock(&self.pipeline.synchronizer).reset();

        let context = self.context.clone();
        let sync = self.pipeline.synchronizer.clone();
        let metrics = self.stages.acquisition.clone();
        let fault = self.last_fault.clone();
        let worker = Worker::spawn("acquisition", move |stop| acquisition_loop(context, sync, metrics, fault, stop))
            .map_err(|e| DaqError::InvalidState(format!("could not start acquisition worker: {}", e)))?;
        self.acquisition = Some(worker);
        self.start_analysis()?;

        self.status = KernelStatus::Running;
        info!("Acquisition started on {} devices", self.device_order.len());
        Ok(())
    }

    /// Stop streaming; the session (if recording) keeps its frames so far
    pub fn stop_acquisition(&mut self) -> DaqResult<()> {
        let worker = match self.acquisition.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        worker.stop();

        if self.pipeline.transport.state() == TransportState::Recording {
            self.stop()?;
        }
        self.stop_analysis();
        let result = self.configure_devices(false);
        self.status = KernelStatus::Stopped;
        info!("Acquisition stopped");
        result
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    fn configure_devices(&self, enable: bool) -> DaqResult<()> {
        let ctx = self.context.as_ref();
        let on = u32::from(enable);

        if enable {
            if let Some(index) = self.registry.fmc_index() {
                if let Some(DeviceKind::Fmc { port_voltage }) = self.registry.get(index).map(|d| &d.kind) {
                    ctx.write_register(index, fmc::PORT_VOLTAGE, fmc::pack_port_voltage(*port_voltage))?;
                }
                ctx.write_register(index, fmc::ENABLE, 1)?;
                if ctx.read_register(index, fmc::LINK_STATE)? == 0 {
                    warn!("Headstage link on device {} is not locked", index);
                }
            }
            if let Some(index) = self.registry.heartbeat_index() {
                let base_hz = ctx.read_register(index, heartbeat::CLK_HZ)?;
                let divider = (base_hz as f64 / self.config.recording.heartbeat_hz).round().max(1.0) as u32;
                ctx.write_register(index, heartbeat::CLK_DIV, divider)?;
                ctx.write_register(index, heartbeat::ENABLE, 1)?;
            }
        }

        for device in &self.device_order {
            ctx.write_register(*device, rhs2116::ENABLE, on)?;
        }
        Ok(())
    }

    fn start_analysis(&mut self) -> DaqResult<()> {
        if !self.analysis.is_empty() {
            return Ok(());
        }
        let spawn_err = |e: std::io::Error| DaqError::InvalidState(format!("could not start analysis worker: {}", e));

        let buffers = self.pipeline.buffers.clone();
        let interval = Duration::from_millis(self.config.buffers.stats_interval_ms.max(1));
        let stats = Worker::spawn("statistics", move |stop| loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    buffers.recompute_thresholds();
                }
                _ => break,
            }
        })
        .map_err(spawn_err)?;

        let buffers = self.pipeline.buffers.clone();
        let store = self.pipeline.spikes.clone();
        let detector = SpikeDetector::new(
            buffers.num_probes(),
            self.config.spikes.clone(),
            self.stages.spikes.clone(),
        );
        let spikes = Worker::spawn("spikes", move |stop| spike_loop(detector, buffers, store, stop))
            .map_err(spawn_err)?;

        self.analysis = vec![stats, spikes];
        Ok(())
    }

    fn stop_analysis(&mut self) {
        for worker in self.analysis.drain(..) {
            worker.stop();
        }
    }

    /// Recompute statistics now instead of waiting for the worker
    pub fn recompute_stats(&self) -> Vec<ProbeStatistics> {
        self.pipeline.buffers.recompute_thresholds()
    }

    pub fn probe_stats(&self) -> Vec<ProbeStatistics> {
        self.pipeline.buffers.probe_stats()
    }

    pub fn buffers(&self) -> Arc<RingBufferEngine> {
        self.pipeline.buffers.clone()
    }

    pub fn spike_history(&self) -> Vec<Spike> {
        lock(&self.pipeline.spikes).history()
    }

    pub fn spike_total(&self) -> u64 {
        lock(&self.pipeline.spikes).total()
    }

    pub fn burst_snapshot(&self) -> BurstSnapshot {
        lock(&self.pipeline.spikes).burst_snapshot()
    }

    pub fn take_spike_diagnostics(&self) -> Vec<Spike> {
        lock(&self.pipeline.spikes).take_diagnostics()
    }

    pub fn clear_spikes(&self) {
        lock(&self.pipeline.spikes).clear();
    }

    pub fn transport_state(&mut self) -> TransportState {
        let state = self.pipeline.transport.state();
        if state == TransportState::Stopped && self.acquisition.is_none() && !self.analysis.is_empty() {
            // playback reached the end on its own
            self.finish_playback();
        }
        state
    }

    fn session_metadata(&self) -> SessionMetadata {
        let sync = lock(&self.pipeline.synchronizer);
        SessionMetadata {
            device_order: sync.device_order().to_vec(),
            payload_bytes: crate::hal::RHS2116_PAYLOAD_BYTES,
            probe_count: sync.num_probes(),
            sample_rate_hz: self.config.sample_rate_hz,
            hub_clock_hz: self.config.hub_clock_hz,
            heartbeat_hz: self.config.recording.heartbeat_hz,
            channel_map: sync.channel_map().as_slice().to_vec(),
            ..SessionMetadata::default()
        }
    }

    /// Start recording the live stream to a new session folder
    pub fn record(&mut self) -> DaqResult<PathBuf> {
        if self.acquisition.is_none() {
            return Err(DaqError::InvalidState("start acquisition before recording".to_string()));
        }
        let metadata = self.session_metadata();
        self.pipeline.transport.record(metadata)
    }

    /// Replay a session through the synchronizer
    pub fn play(&mut self, dir: &Path, realtime: bool) -> DaqResult<()> {
        if self.acquisition.is_some() {
            return Err(DaqError::InvalidState("stop acquisition before playback".to_string()));
        }
        self.pipeline.transport.play(dir, realtime)?;
        self.start_analysis()?;
        self.status = KernelStatus::Running;
        Ok(())
    }

    pub fn pause(&mut self) -> DaqResult<()> {
        self.pipeline.transport.pause()
    }

    pub fn resume(&mut self) -> DaqResult<()> {
        self.pipeline.transport.resume()
    }

    /// End recording or playback
    pub fn stop(&mut self) -> DaqResult<StopOutcome> {
        let outcome = self.pipeline.transport.stop();
        if self.acquisition.is_none() {
            self.finish_playback();
        }
        if let Err(e) = &outcome {
            *lock(&self.last_fault) = Some(e.to_string());
        }
        outcome
    }

    fn finish_playback(&mut self) {
        self.stop_analysis();
        self.status = KernelStatus::Stopped;
        // playback overrides the published stimulus; put the committed id back
        self.stimulus_state.set(false, self.pipeline.stimulus.committed_id());
    }

    pub fn playback_status(&self) -> Option<Arc<PlaybackStatus>> {
        self.pipeline.transport.playback_status()
    }

    /// Wait for a finite playback to reach its end
    pub fn wait_for_playback(&mut self, timeout: Duration) -> bool {
        let status = match self.playback_status() {
            Some(status) => status,
            None => return true,
        };
        let deadline = std::time::Instant::now() + timeout;
        while !status.finished.load(std::sync::atomic::Ordering::Acquire) {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.transport_state();
        true
    }

    pub fn metrics(&self) -> BTreeMap<String, MetricsSnapshot> {
        self.collector.snapshot()
    }

    pub fn monitor(&self) -> KernelMonitor {
        KernelMonitor::new(self.collector.clone())
    }

    /// Most recent fault reported by a worker or a failed operation
    pub fn last_fault(&self) -> Option<String> {
        lock(&self.last_fault).clone()
    }

    /// Stop every worker and session
    pub fn shutdown(&mut self) -> DaqResult<()> {
        let stopped = self.stop_acquisition();
        let transport = self.stop().map(|_| ());
        self.stop_analysis();
        self.status = KernelStatus::Stopped;
        stopped.and(transport)
    }
}

impl Drop for AcquisitionKernel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Error shutting down kernel: {}", e);
        }
    }
}

fn acquisition_loop(
    context: Arc<dyn OniContext>,
    sync: Arc<Mutex<MultiDeviceSynchronizer>>,
    metrics: Arc<StageMetrics>,
    fault: Arc<Mutex<Option<String>>>,
    stop: Receiver<()>,
) {
    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match context.read_frame(READ_TIMEOUT) {
            Ok(Some(frame)) => {
                let start = metrics.start_processing();
                if let IngestOutcome::Resynced(f) = lock(&sync).ingest(frame) {
                    debug!("Acquisition resynced: {}", f);
                }
                metrics.record_frame_processed();
                metrics.finish_processing(start);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Frame read failed: {}", e);
                metrics.record_fault();
                *lock(&fault) = Some(e.to_string());
                thread::sleep(FAULT_BACKOFF);
            }
        }
    }
}

fn spike_loop(
    mut detector: SpikeDetector,
    buffers: Arc<RingBufferEngine>,
    store: Arc<Mutex<SpikeStore>>,
    stop: Receiver<()>,
) {
    let wake = buffers.wake_receiver();
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(wake) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            default(SPIKE_POLL) => {}
        }

        let spikes = detector.process(&buffers);
        let mut store = lock(&store);
        for spike in spikes {
            store.push(spike);
        }
        store.advance_to(detector.position());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::SimulatedOni;

    fn kernel(chips: u32) -> (AcquisitionKernel, Arc<SimulatedOni>) {
        let oni = Arc::new(SimulatedOni::with_headstage(chips));
        let kernel = AcquisitionKernel::new(DaqConfig::default(), oni.clone()).unwrap();
        (kernel, oni)
    }

    #[test]
    fn test_kernel_status_default() {
        let (kernel, _) = kernel(2);
        assert_eq!(kernel.status(), KernelStatus::Stopped);
        assert!(kernel.device_order().is_empty());
    }

    #[test]
    fn test_add_device_grows_order() {
        let (mut kernel, _) = kernel(2);
        kernel.add_device(0).unwrap();
        assert!(kernel.device_order().is_empty());

        assert_eq!(kernel.add_device(257).unwrap(), DeviceKind::Rhs2116 { device_index: 257 });
        kernel.add_device(256).unwrap();
        assert_eq!(kernel.device_order(), &[256, 257]);
        assert_eq!(kernel.num_probes(), 32);
        assert_eq!(kernel.channel_map(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_group_sets_order() {
        let (mut kernel, _) = kernel(2);
        kernel.add_device(256).unwrap();
        kernel.add_device(257).unwrap();
        kernel.set_acquisition_group(vec![257, 256]).unwrap();
        assert_eq!(kernel.device_order(), &[257, 256]);
    }

    #[test]
    fn test_start_requires_devices() {
        let (mut kernel, _) = kernel(1);
        assert!(kernel.start_acquisition().is_err());
    }

    #[test]
    fn test_start_configures_headstage() {
        let (mut kernel, oni) = kernel(1);
        for idx in [0, 1, 256] {
            kernel.add_device(idx).unwrap();
        }
        kernel.start_acquisition().unwrap();
        assert_eq!(kernel.status(), KernelStatus::Running);
        assert_eq!(oni.register(256, rhs2116::ENABLE), Some(1));
        assert_eq!(oni.register(0, fmc::PORT_VOLTAGE), Some(50));
        assert_eq!(oni.register(1, heartbeat::CLK_DIV), Some(2_500_000));

        kernel.stop_acquisition().unwrap();
        assert_eq!(kernel.status(), KernelStatus::Stopped);
        assert_eq!(oni.register(256, rhs2116::ENABLE), Some(0));
    }

    #[test]
    fn test_record_requires_acquisition() {
        let (mut kernel, _) = kernel(1);
        kernel.add_device(256).unwrap();
        assert!(matches!(kernel.record(), Err(DaqError::InvalidState(_))));
    }
}
