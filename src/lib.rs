//! Multi-device RHS2116 acquisition and stimulation.
//!
//! Raw device frames are collated into logical multi-probe samples by the
//! [`sync`] stage, buffered with online statistics in [`buffers`], scanned
//! for spikes in [`spikes`], and recorded or replayed by [`recording`].
//! [`stimulus`] compiles stimulation waveforms into sequencer delta tables.
//! [`engine::AcquisitionKernel`] owns all of it.

pub mod buffers;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod hal;
pub mod observability;
pub mod recording;
pub mod spikes;
pub mod stimulus;
pub mod sync;

pub use config::DaqConfig;
pub use engine::{AcquisitionKernel, KernelStatus};
pub use error::{ConfigurationError, DaqError, DaqResult, HardwareFault, SyncFault};
