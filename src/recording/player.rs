use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::streams::SessionReader;
use crate::error::DaqResult;
use crate::hal::RawDeviceFrame;
use crate::observability::StageMetrics;
use crate::stimulus::StimulusState;
use crate::sync::MultiDeviceSynchronizer;

/// Estimates how much faster or slower the recorded wall clock ran than the
/// acquisition clock, from the frame count alone.
///
/// Every `sample_rate / tick_hz` recorded frames span one nominal tick of
/// `1 / tick_hz` seconds of acquisition time. The recorded wall-clock stamps
/// of those frames show how long that actually took. The factor is an
/// exponential moving average of `nominal / observed`, clamped.
#[derive(Debug, Clone)]
pub struct FrameCountDrift {
    nominal_period_ns: f64,
    smoothing: f64,
    min_factor: f64,
    max_factor: f64,
    factor: f64,
    last_tick_ns: Option<u64>,
}

impl FrameCountDrift {
    pub fn new(tick_hz: f64) -> Self {
        Self {
            nominal_period_ns: 1e9 / tick_hz,
            smoothing: 0.1,
            min_factor: 0.5,
            max_factor: 2.0,
            factor: 1.0,
            last_tick_ns: None,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Feed the recorded timestamp of a tick frame; returns the new factor
    pub fn observe(&mut self, timestamp_ns: u64) -> f64 {
        if let Some(last) = self.last_tick_ns {
            let observed = timestamp_ns.saturating_sub(last) as f64;
            if observed > 0.0 {
                let ratio = self.nominal_period_ns / observed;
                self.factor += self.smoothing * (ratio - self.factor);
                self.factor = self.factor.clamp(self.min_factor, self.max_factor);
            }
        }
        self.last_tick_ns = Some(timestamp_ns);
        self.factor
    }

    pub fn reset(&mut self) {
        self.factor = 1.0;
        self.last_tick_ns = None;
    }
}

/// Maps recorded timestamps to playback deadlines
#[derive(Debug, Clone)]
pub struct Pacer {
    anchor_wall: Instant,
    anchor_ts_ns: u64,
    factor: f64,
}

impl Pacer {
    pub fn new(first_ts_ns: u64) -> Self {
        Self {
            anchor_wall: Instant::now(),
            anchor_ts_ns: first_ts_ns,
            factor: 1.0,
        }
    }

    pub fn due(&self, ts_ns: u64) -> Instant {
        let elapsed = ts_ns.saturating_sub(self.anchor_ts_ns) as f64 * self.factor;
        self.anchor_wall + Duration::from_nanos(elapsed as u64)
    }

    /// Continue from `ts_ns` at its current deadline with a new factor
    pub fn reanchor(&mut self, ts_ns: u64, factor: f64) {
        self.anchor_wall = self.due(ts_ns);
        self.anchor_ts_ns = ts_ns;
        self.factor = factor;
    }

    /// Push every future deadline back, e.g. by the time spent paused
    pub fn delay(&mut self, by: Duration) {
        self.anchor_wall += by;
    }

    pub fn restart(&mut self, first_ts_ns: u64) {
        self.anchor_wall = Instant::now();
        self.anchor_ts_ns = first_ts_ns;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub loop_playback: bool,
    /// Drift reference rate; one tick every `frames_per_tick` frames
    pub tick_hz: f64,
    pub frames_per_tick: u64,
    /// Pace to recorded timestamps; when false frames are replayed back to back
    pub realtime: bool,
}

/// Progress shared between the playback worker and the kernel
#[derive(Debug, Default)]
pub struct PlaybackStatus {
    pub frames_played: AtomicU64,
    pub loops: AtomicU64,
    pub paused: AtomicBool,
    pub finished: AtomicBool,
    drift_millionths: AtomicU64,
}

impl PlaybackStatus {
    pub fn drift_factor(&self) -> f64 {
        match self.drift_millionths.load(Ordering::Relaxed) {
            0 => 1.0,
            v => v as f64 / 1e6,
        }
    }

    fn set_drift_factor(&self, factor: f64) {
        self.drift_millionths
            .store((factor * 1e6).round() as u64, Ordering::Relaxed);
    }
}

/// Everything the playback worker needs
pub struct PlaybackJob {
    pub reader: SessionReader,
    pub device_order: Vec<u32>,
    pub payload_bytes: usize,
    /// Session catalog index -> stimulus library id
    pub stimulus_ids: Vec<i32>,
    pub synchronizer: Arc<Mutex<MultiDeviceSynchronizer>>,
    pub stimulus: Arc<StimulusState>,
    pub options: PlaybackOptions,
    pub status: Arc<PlaybackStatus>,
    pub metrics: Arc<StageMetrics>,
}

enum Wait {
    Continue,
    Stop,
}

/// Hold while paused; returns once resumed or stopped
fn hold(ctrl: &Receiver<PlayerCommand>, pacer: &mut Pacer, status: &PlaybackStatus) -> Wait {
    let paused_at = Instant::now();
    status.paused.store(true, Ordering::Release);
    let outcome = loop {
        match ctrl.recv() {
            Ok(PlayerCommand::Resume) => break Wait::Continue,
            Ok(PlayerCommand::Pause) => continue,
            Ok(PlayerCommand::Stop) | Err(_) => break Wait::Stop,
        }
    };
    status.paused.store(false, Ordering::Release);
    pacer.delay(paused_at.elapsed());
    outcome
}

/// Block until the deadline of recorded timestamp `ts_ns`, handling commands
fn wait_for(ts_ns: u64, ctrl: &Receiver<PlayerCommand>, pacer: &mut Pacer, status: &PlaybackStatus) -> Wait {
    loop {
        let timeout = pacer.due(ts_ns).saturating_duration_since(Instant::now());
        match ctrl.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => return Wait::Continue,
            Err(RecvTimeoutError::Disconnected) | Ok(PlayerCommand::Stop) => return Wait::Stop,
            Ok(PlayerCommand::Resume) => continue,
            Ok(PlayerCommand::Pause) => {
                if let Wait::Stop = hold(ctrl, pacer, status) {
                    return Wait::Stop;
                }
            }
        }
    }
}

/// Replay a session through the synchronizer until EOF or stop
pub fn run_player(mut job: PlaybackJob, ctrl: Receiver<PlayerCommand>) -> DaqResult<u64> {
    let first_ts = job.reader.time_at(0).unwrap_or(0);
    let mut pacer = Pacer::new(first_ts);
    let mut drift = FrameCountDrift::new(job.options.tick_hz);
    let per_tick = job.options.frames_per_tick.max(1);
    let mut played = 0u64;

    info!(
        "Playing {} frames ({:.2} s)",
        job.reader.frames(),
        job.reader.duration_ns() as f64 / 1e9
    );

    let result = loop {
        let index = job.reader.position();
        let frame = match job.reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if job.options.loop_playback && job.reader.frames() > 0 {
                    if let Err(e) = job.reader.rewind() {
                        break Err(e);
                    }
                    job.synchronizer
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .reset();
                    pacer.restart(first_ts);
                    drift.reset();
                    job.status.loops.fetch_add(1, Ordering::Relaxed);
                    debug!("Looping playback");
                    continue;
                }
                break Ok(played);
            }
            Err(e) => break Err(e),
        };

        let wait = if job.options.realtime {
            wait_for(frame.wall_clock_ns, &ctrl, &mut pacer, &job.status)
        } else {
            match ctrl.try_recv() {
                Ok(PlayerCommand::Stop) => Wait::Stop,
                Ok(PlayerCommand::Pause) => hold(&ctrl, &mut pacer, &job.status),
                _ => Wait::Continue,
            }
        };
        if let Wait::Stop = wait {
            break Ok(played);
        }

        if index % per_tick == 0 {
            let factor = drift.observe(frame.wall_clock_ns);
            pacer.reanchor(frame.wall_clock_ns, factor);
            job.status.set_drift_factor(factor);
        }

        let start = job.metrics.start_processing();
        let id = usize::try_from(frame.stimulus_id)
            .ok()
            .and_then(|i| job.stimulus_ids.get(i).copied());
        match id {
            Some(id) => job.stimulus.set(true, id),
            None => job.stimulus.clear(),
        }

        {
            let mut sync = job.synchronizer.lock().unwrap_or_else(|p| p.into_inner());
            for (device, chunk) in job
                .device_order
                .iter()
                .zip(frame.payload.chunks(job.payload_bytes))
            {
                sync.ingest(RawDeviceFrame::new(*device, frame.clock_ticks, chunk.to_vec()));
            }
        }

        played += 1;
        job.status.frames_played.store(played, Ordering::Relaxed);
        job.metrics.record_frame_processed();
        job.metrics.finish_processing(start);
    };

    job.stimulus.clear();
    job.status.finished.store(true, Ordering::Release);
    match &result {
        Ok(n) => info!("Playback finished after {} frames", n),
        Err(e) => warn!("Playback stopped: {}", e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_converges_to_ratio() {
        let mut drift = FrameCountDrift::new(100.0);
        // tick frames recorded 5% too far apart
        let mut ts = 0;
        for _ in 0..200 {
            drift.observe(ts);
            ts += 10_500_000;
        }
        assert!((drift.factor() - 1.0 / 1.05).abs() < 1e-3);
    }

    #[test]
    fn test_drift_from_frame_spacing() {
        // 30 kHz frames, one tick per 300 frames, stamps 2% closer than nominal
        let per_tick = 300u64;
        let mut drift = FrameCountDrift::new(100.0);
        for index in 0..60_000u64 {
            let wall_ns = (index as f64 * 1e9 / 30_000.0 / 1.02) as u64;
            if index % per_tick == 0 {
                drift.observe(wall_ns);
            }
        }
        assert!((drift.factor() - 1.02).abs() < 1e-3);
    }

    #[test]
    fn test_drift_clamped() {
        let mut drift = FrameCountDrift::new(100.0);
        let mut ts = 0;
        for _ in 0..500 {
            drift.observe(ts);
            ts += 1;
        }
        assert_eq!(drift.factor(), 2.0);
    }

    #[test]
    fn test_pacer_reanchor_is_continuous() {
        let mut pacer = Pacer::new(1_000);
        let before = pacer.due(1_000_000);
        pacer.reanchor(1_000_000, 0.5);
        assert_eq!(pacer.due(1_000_000), before);
        assert_eq!(pacer.due(3_000_000) - before, Duration::from_nanos(1_000_000));
    }

    #[test]
    fn test_pause_delays_deadlines() {
        let mut pacer = Pacer::new(0);
        let before = pacer.due(10);
        pacer.delay(Duration::from_millis(5));
        assert_eq!(pacer.due(10) - before, Duration::from_millis(5));
    }
}
