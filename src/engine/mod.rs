pub mod kernel;
pub mod worker;

pub use kernel::{AcquisitionKernel, KernelStatus};
pub use worker::Worker;
