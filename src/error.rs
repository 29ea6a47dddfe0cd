use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for the acquisition core
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Top-level fault taxonomy
#[derive(Debug, Error)]
pub enum DaqError {
    /// Register verify mismatch or read/write failure
    #[error(transparent)]
    HardwareIo(#[from] HardwareFault),

    /// Missing or out-of-order device frame (recovered by resync)
    #[error(transparent)]
    Synchronization(#[from] SyncFault),

    /// Rejected before any hardware write
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Stream I/O failure, fatal to the current session only
    #[error("storage fault at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Stale or inconsistent recording, handled without aborting
    #[error("data integrity warning: {0}")]
    DataIntegrity(String),

    /// Operation not allowed in the current transport/kernel state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl DaqError {
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Faults that are recovered locally and never end a session
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Synchronization(_) | Self::DataIntegrity(_))
    }
}

/// Hardware register I/O faults
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareFault {
    #[error("register 0x{address:04X} on device {device}: wrote 0x{expected:08X}, read back 0x{actual:08X}")]
    VerifyMismatch {
        device: u32,
        address: u32,
        expected: u32,
        actual: u32,
    },

    #[error("write to register 0x{address:04X} on device {device} failed")]
    WriteFailed { device: u32, address: u32 },

    #[error("read of register 0x{address:04X} on device {device} failed")]
    ReadFailed { device: u32, address: u32 },

    #[error("device {device} reported status 0x{status:08X} after commit")]
    BadStatus { device: u32, status: u32 },

    #[error("frame read failed: {0}")]
    FrameRead(String),
}

/// Synchronization faults reported by the multi-device synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFault {
    #[error("cycle {cycle} incomplete: got {received} of {expected} device frames, resynced at device {resync_device}")]
    IncompleteCycle {
        cycle: u64,
        received: usize,
        expected: usize,
        resync_device: u32,
    },

    #[error("payload for device {device} is {got} bytes, expected {expected}")]
    PayloadSize {
        device: u32,
        got: usize,
        expected: usize,
    },
}

/// Configuration problems detected before touching hardware
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("channel map has {got} entries, expected {expected}")]
    ChannelMapSize { expected: usize, got: usize },

    #[error("channel map is not a permutation: electrode {electrode} assigned twice or out of range")]
    NotAPermutation { electrode: usize },

    #[error("stimulus for probe {probe} is invalid: {reason}")]
    InvalidDescriptor { probe: usize, reason: String },

    #[error("stimulus for probe {probe} requests {requested_ua} µA, beyond the largest step size")]
    AmplitudeOutOfRange { probe: usize, requested_ua: f64 },

    #[error("delta table for device {device} needs {keys} time keys, hardware limit is {limit}")]
    DeltaTableOverflow {
        device: u32,
        keys: usize,
        limit: usize,
    },

    #[error("expected {expected} stimulus descriptors, got {got}")]
    DescriptorCount { expected: usize, got: usize },

    #[error("unknown device index {0}")]
    UnknownDevice(u32),

    #[error("device {device} has type id {type_id}, expected {expected}")]
    WrongDeviceKind {
        device: u32,
        type_id: u32,
        expected: &'static str,
    },

    #[error("invalid buffer configuration: {0}")]
    Buffer(String),
}
