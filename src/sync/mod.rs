pub mod synchronizer;

pub use synchronizer::{IngestOutcome, MultiDeviceSynchronizer};
