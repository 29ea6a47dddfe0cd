pub mod frame;
pub mod sink;

pub use frame::{MultiProbeFrame, SyncedCycle};
pub use sink::FrameSink;
