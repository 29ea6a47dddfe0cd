pub mod engine;
pub mod ring;
pub mod stats;

pub use engine::RingBufferEngine;
pub use ring::{MirroredChannel, SampleRing};
pub use stats::ProbeStatistics;
