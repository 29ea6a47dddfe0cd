use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::types::{DeviceEntry, RawDeviceFrame};
use crate::error::HardwareFault;

/// Blocking register/stream primitives of an open ONI context.
///
/// Implementations are shared between the acquisition worker and the
/// control path, so every method takes `&self`.
pub trait OniContext: Send + Sync {
    /// Read a 32-bit device register
    fn read_register(&self, device: u32, address: u32) -> Result<u32, HardwareFault>;

    /// Write a 32-bit device register
    fn write_register(&self, device: u32, address: u32, value: u32) -> Result<(), HardwareFault>;

    /// Block until the next frame arrives or `timeout` elapses
    fn read_frame(&self, timeout: Duration) -> Result<Option<RawDeviceFrame>, HardwareFault>;

    /// Device table as enumerated when the context was opened
    fn device_table(&self) -> Vec<DeviceEntry>;
}

/// Trait implemented by hardware drivers for device discovery
#[async_trait]
pub trait HardwareDriver: Send + Sync {
    /// Unique driver identifier (e.g., "oni-simulated", "riffa")
    fn driver_id(&self) -> &str;

    /// Enumerate the device table (may block on the bus)
    async fn discover_devices(&self) -> Result<Vec<DeviceEntry>>;
}
