pub mod driver;
pub mod oni;

pub use driver::SimulatedDriver;
pub use oni::SimulatedOni;
