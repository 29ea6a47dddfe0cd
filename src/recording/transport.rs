use crossbeam_channel::{unbounded, Sender};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::player::{run_player, PlaybackJob, PlaybackOptions, PlaybackStatus, PlayerCommand};
use super::recorder::{ActiveRecording, RecordingSummary, RECORDER_SINK};
use super::session::{RecordingSession, SessionMetadata};
use super::state::TransportState;
use super::streams::SessionReader;
use crate::config::RecordingConfig;
use crate::error::{DaqError, DaqResult};
use crate::observability::StageMetrics;
use crate::stimulus::{StimulusLibrary, StimulusState};
use crate::sync::MultiDeviceSynchronizer;

struct ActivePlayback {
    ctrl: Sender<PlayerCommand>,
    handle: JoinHandle<DaqResult<u64>>,
    status: Arc<PlaybackStatus>,
    dir: PathBuf,
    restore_map: Option<Vec<usize>>,
}

/// Result of leaving a recording or playback state
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Idle,
    Recorded(RecordingSummary),
    Played { dir: PathBuf, frames: u64 },
}

/// Record/playback transport over the shared synchronizer
pub struct RecorderPlayer {
    config: RecordingConfig,
    state: TransportState,
    synchronizer: Arc<Mutex<MultiDeviceSynchronizer>>,
    stimulus: Arc<StimulusState>,
    library: Arc<Mutex<StimulusLibrary>>,
    recording: Option<ActiveRecording>,
    playback: Option<ActivePlayback>,
    recorder_metrics: Arc<StageMetrics>,
    player_metrics: Arc<StageMetrics>,
}

impl RecorderPlayer {
    pub fn new(
        config: RecordingConfig,
        synchronizer: Arc<Mutex<MultiDeviceSynchronizer>>,
        stimulus: Arc<StimulusState>,
        library: Arc<Mutex<StimulusLibrary>>,
        recorder_metrics: Arc<StageMetrics>,
        player_metrics: Arc<StageMetrics>,
    ) -> Self {
        Self {
            config,
            state: TransportState::Stopped,
            synchronizer,
            stimulus,
            library,
            recording: None,
            playback: None,
            recorder_metrics,
            player_metrics,
        }
    }

    fn sync(&self) -> MutexGuard<'_, MultiDeviceSynchronizer> {
        self.synchronizer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&mut self, target: TransportState) -> DaqResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(DaqError::InvalidState(format!(
                "cannot go from {} to {}",
                self.state.name(),
                target.name()
            )));
        }
        self.state = target;
        Ok(())
    }

    /// Current state, after noticing sessions that ended on their own
    pub fn state(&mut self) -> TransportState {
        let recording_failed = self.recording.as_ref().map_or(false, |r| r.has_failed());
        if recording_failed {
            if let Err(e) = self.stop() {
                error!("Recording ended with: {}", e);
            }
        }

        let playback_done = self
            .playback
            .as_ref()
            .map_or(false, |p| p.status.finished.load(Ordering::Acquire));
        if playback_done {
            if let Err(e) = self.stop() {
                warn!("Playback ended with: {}", e);
            }
        }
        self.state
    }

    pub fn playback_status(&self) -> Option<Arc<PlaybackStatus>> {
        self.playback.as_ref().map(|p| p.status.clone())
    }

    pub fn recording_dir(&self) -> Option<&Path> {
        self.recording.as_ref().map(|r| r.dir().as_path())
    }

    /// Start a new session under the configured root
    pub fn record(&mut self, metadata: SessionMetadata) -> DaqResult<PathBuf> {
        self.state();
        if !self.state.can_transition_to(TransportState::Recording) {
            return Err(DaqError::InvalidState(format!("cannot record while {}", self.state.name())));
        }

        let session = RecordingSession::create(&self.config.root_dir, metadata)?;
        let recording = ActiveRecording::start(
            session,
            self.library.clone(),
            self.config.queue_capacity,
            self.recorder_metrics.clone(),
        )?;
        let dir = recording.dir().clone();

        self.sync().subscribe(recording.sink.clone());
        self.recording = Some(recording);
        self.transition(TransportState::Recording)?;
        info!("Recording to {:?}", dir);
        Ok(dir)
    }

    /// Replay a session through the synchronizer
    pub fn play(&mut self, dir: &Path, realtime: bool) -> DaqResult<()> {
        self.state();
        if !self.state.can_transition_to(TransportState::Playing) || self.state != TransportState::Stopped {
            return Err(DaqError::InvalidState(format!("cannot play while {}", self.state.name())));
        }

        let session = RecordingSession::open(dir)?;
        let meta = session.metadata().clone();
        {
            let sync = self.sync();
            if sync.device_order() != meta.device_order.as_slice() {
                return Err(DaqError::DataIntegrity(format!(
                    "session devices {:?} do not match configured devices {:?}",
                    meta.device_order,
                    sync.device_order()
                )));
            }
        }
        let reader = SessionReader::open(&session)?;

        let restore_map = {
            let mut sync = self.sync();
            let previous = sync.channel_map().as_slice().to_vec();
            let restore = if !meta.channel_map.is_empty() && meta.channel_map != previous {
                sync.set_channel_map(meta.channel_map.clone())?;
                Some(previous)
            } else {
                None
            };
            sync.reset();
            restore
        };

        let stimulus_ids: Vec<i32> = {
            let mut library = self.library.lock().unwrap_or_else(|p| p.into_inner());
            reader.catalog().iter().map(|set| library.intern(set)).collect()
        };

        let status = Arc::new(PlaybackStatus::default());
        let (ctrl, ctrl_rx) = unbounded();
        let job = PlaybackJob {
            reader,
            payload_bytes: meta.payload_bytes,
            device_order: meta.device_order.clone(),
            stimulus_ids,
            synchronizer: self.synchronizer.clone(),
            stimulus: self.stimulus.clone(),
            options: PlaybackOptions {
                loop_playback: self.config.loop_playback,
                tick_hz: meta.heartbeat_hz,
                frames_per_tick: meta.frames_per_heartbeat(),
                realtime,
            },
            status: status.clone(),
            metrics: self.player_metrics.clone(),
        };

        let handle = thread::Builder::new()
            .name("player".to_string())
            .spawn(move || run_player(job, ctrl_rx))
            .map_err(|e| DaqError::storage(dir, e))?;

        self.playback = Some(ActivePlayback {
            ctrl,
            handle,
            status,
            dir: dir.to_path_buf(),
            restore_map,
        });
        self.transition(TransportState::Playing)
    }

    pub fn pause(&mut self) -> DaqResult<()> {
        self.state();
        self.transition(TransportState::Paused)?;
        if let Some(p) = &self.playback {
            let _ = p.ctrl.send(PlayerCommand::Pause);
        }
        Ok(())
    }

    pub fn resume(&mut self) -> DaqResult<()> {
        self.state();
        if self.state != TransportState::Paused {
            return Err(DaqError::InvalidState(format!("cannot resume while {}", self.state.name())));
        }
        self.transition(TransportState::Playing)?;
        if let Some(p) = &self.playback {
            let _ = p.ctrl.send(PlayerCommand::Resume);
        }
        Ok(())
    }

    /// Finish whatever is running; stopping while stopped is a no-op
    pub fn stop(&mut self) -> DaqResult<StopOutcome> {
        if let Some(recording) = self.recording.take() {
            self.sync().unsubscribe(RECORDER_SINK);
            self.state = TransportState::Stopped;
            return recording.finish().map(StopOutcome::Recorded);
        }

        if let Some(playback) = self.playback.take() {
            let _ = playback.ctrl.send(PlayerCommand::Stop);
            let result = playback
                .handle
                .join()
                .map_err(|_| DaqError::InvalidState("player thread panicked".to_string()))
                .and_then(|r| r);

            if let Some(map) = playback.restore_map {
                if let Err(e) = self.sync().set_channel_map(map) {
                    error!("Could not restore channel map after playback: {}", e);
                }
            }
            self.stimulus.clear();
            self.state = TransportState::Stopped;
            return result.map(|frames| StopOutcome::Played {
                dir: playback.dir,
                frames,
            });
        }

        self.state = TransportState::Stopped;
        Ok(StopOutcome::Idle)
    }
}

impl Drop for RecorderPlayer {
    fn drop(&mut self) {
        if self.recording.is_some() || self.playback.is_some() {
            if let Err(e) = self.stop() {
                error!("Error stopping transport on drop: {}", e);
            }
        }
    }
}
