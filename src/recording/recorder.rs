use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, info, warn};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::session::RecordingSession;
use super::streams::{RecordedFrame, SessionWriter};
use crate::core::{FrameSink, SyncedCycle};
use crate::error::{DaqError, DaqResult};
use crate::observability::StageMetrics;
use crate::stimulus::StimulusLibrary;

pub const RECORDER_SINK: &str = "recorder";

enum WriterMessage {
    Frame(RecordedFrame),
    Stop,
}

/// What a finished recording left on disk
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub dir: PathBuf,
    pub frames: u64,
    pub stimulus_sets: usize,
}

/// Frame sink feeding the session writer thread.
///
/// `on_frame` only copies the cycle into a bounded queue. A full queue means
/// the disk cannot keep up; frames are never dropped silently, so the session
/// is failed and ended instead.
pub struct RecorderSink {
    tx: Sender<WriterMessage>,
    overflowed: Arc<AtomicBool>,
    metrics: Arc<StageMetrics>,
}

impl FrameSink for RecorderSink {
    fn name(&self) -> &str {
        RECORDER_SINK
    }

    fn on_frame(&self, cycle: &SyncedCycle) {
        if self.overflowed.load(Ordering::Acquire) {
            self.metrics.record_dropped(1);
            return;
        }

        let frame = RecordedFrame {
            clock_ticks: cycle.frame.clock_ticks,
            payload: cycle.raw_payload.clone(),
            wall_clock_ns: cycle.wall_clock_ns,
            stimulus_id: cycle.frame.stimulus_id,
        };

        match self.tx.try_send(WriterMessage::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                error!("Recorder queue full, ending session");
                self.overflowed.store(true, Ordering::Release);
                self.metrics.record_fault();
                self.metrics.record_dropped(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.record_dropped(1);
            }
        }
    }
}

/// A recording in progress: the sink to subscribe and its writer thread
pub struct ActiveRecording {
    pub sink: Arc<RecorderSink>,
    tx: Sender<WriterMessage>,
    overflowed: Arc<AtomicBool>,
    handle: Option<JoinHandle<DaqResult<RecordingSummary>>>,
    dir: PathBuf,
}

impl ActiveRecording {
    pub fn start(
        session: RecordingSession,
        library: Arc<Mutex<StimulusLibrary>>,
        queue_capacity: usize,
        metrics: Arc<StageMetrics>,
    ) -> DaqResult<Self> {
        let writer = SessionWriter::open(&session)?;
        let (tx, rx) = bounded(queue_capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));
        let dir = session.dir().to_path_buf();

        let sink = Arc::new(RecorderSink {
            tx: tx.clone(),
            overflowed: overflowed.clone(),
            metrics: metrics.clone(),
        });

        let worker_overflowed = overflowed.clone();
        let handle = thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || run_writer(session, writer, library, rx, worker_overflowed, metrics))
            .map_err(|e| DaqError::storage(&dir, e))?;

        Ok(Self {
            sink,
            tx,
            overflowed,
            handle: Some(handle),
            dir,
        })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// True once the writer has stopped on its own (queue overflow or I/O error)
    pub fn has_failed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
            || self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop the writer after it drains the queue, and wait for it
    pub fn finish(mut self) -> DaqResult<RecordingSummary> {
        // The queue may be full; a blocking send waits for the writer to drain
        let _ = self.tx.send(WriterMessage::Stop);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DaqError::InvalidState("recorder thread panicked".to_string()))?,
            None => Err(DaqError::InvalidState("recorder already finished".to_string())),
        }
    }
}

fn run_writer(
    session: RecordingSession,
    mut writer: SessionWriter,
    library: Arc<Mutex<StimulusLibrary>>,
    rx: Receiver<WriterMessage>,
    overflowed: Arc<AtomicBool>,
    metrics: Arc<StageMetrics>,
) -> DaqResult<RecordingSummary> {
    // global library id -> session catalog index
    let mut catalog_ids: HashMap<i32, i32> = HashMap::new();

    let result = (|| -> DaqResult<()> {
        while let Ok(message) = rx.recv() {
            let mut frame = match message {
                WriterMessage::Frame(frame) => frame,
                WriterMessage::Stop => break,
            };

            if frame.stimulus_id >= 0 {
                frame.stimulus_id = match catalog_ids.get(&frame.stimulus_id) {
                    Some(id) => *id,
                    None => {
                        let set = library
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .get(frame.stimulus_id)
                            .cloned();
                        match set {
                            Some(set) => {
                                let id = writer.write_catalog(&set)?;
                                catalog_ids.insert(frame.stimulus_id, id);
                                id
                            }
                            None => {
                                warn!("Stimulus id {} not in library, recording as none", frame.stimulus_id);
                                -1
                            }
                        }
                    }
                };
            }

            let start = metrics.start_processing();
            writer.write_frame(&frame)?;
            metrics.record_frame_processed();
            metrics.finish_processing(start);

            if overflowed.load(Ordering::Acquire) {
                return Err(DaqError::storage(
                    session.dir(),
                    io::Error::new(io::ErrorKind::Other, "recorder queue overflow"),
                ));
            }
        }
        Ok(())
    })();

    if let Err(e) = writer.flush() {
        error!("Failed to flush session {:?}: {}", session.dir(), e);
    }

    match result {
        Ok(()) => {
            info!("Recorded {} frames to {:?}", writer.frames(), session.dir());
            Ok(RecordingSummary {
                dir: session.dir().to_path_buf(),
                frames: writer.frames(),
                stimulus_sets: catalog_ids.len(),
            })
        }
        Err(e) => {
            // Keep the sink from queueing more frames
            overflowed.store(true, Ordering::Release);
            error!("Recording to {:?} ended early: {}", session.dir(), e);
            Err(e)
        }
    }
}
