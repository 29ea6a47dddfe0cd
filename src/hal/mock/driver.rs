use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::SimulatedOni;
use crate::hal::traits::{HardwareDriver, OniContext};
use crate::hal::types::DeviceEntry;

/// Discovery front end for a [`SimulatedOni`] context
pub struct SimulatedDriver {
    context: Arc<SimulatedOni>,
}

impl SimulatedDriver {
    pub fn new(context: Arc<SimulatedOni>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> Arc<SimulatedOni> {
        self.context.clone()
    }
}

#[async_trait]
impl HardwareDriver for SimulatedDriver {
    fn driver_id(&self) -> &str {
        "oni-simulated"
    }

    async fn discover_devices(&self) -> Result<Vec<DeviceEntry>> {
        // Table enumeration blocks on the bus for real contexts
        let context = self.context.clone();
        let table = tokio::task::spawn_blocking(move || context.device_table()).await?;
        Ok(table)
    }
}
