pub mod channel_mapper;
pub mod mock;
pub mod registers;
pub mod registry;
pub mod traits;
pub mod types;

pub use channel_mapper::ChannelMap;
pub use registry::{DeviceRegistry, RegisteredDevice};
pub use traits::{HardwareDriver, OniContext};
pub use types::{
    DeviceEntry, DeviceKind, RawDeviceFrame, Rhs2116Sample,
    RHS2116_CHANNELS, RHS2116_PAYLOAD_BYTES,
};
