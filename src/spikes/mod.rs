pub mod config;
pub mod detector;
pub mod store;

pub use config::{Alignment, EdgeMode, SpikeConfig};
pub use detector::{Spike, SpikeDetector};
pub use store::{BurstAccumulator, BurstSnapshot, SpikeStore};
