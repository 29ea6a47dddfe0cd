//! Session recording and drift-corrected playback.

pub mod player;
pub mod recorder;
pub mod session;
pub mod state;
pub mod streams;
pub mod transport;

pub use player::{FrameCountDrift, Pacer, PlaybackStatus};
pub use recorder::{RecorderSink, RecordingSummary};
pub use session::{RecordingSession, SessionMetadata, FORMAT_VERSION};
pub use state::TransportState;
pub use streams::{RecordedFrame, SessionReader, SessionWriter};
pub use transport::{RecorderPlayer, StopOutcome};
