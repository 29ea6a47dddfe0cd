use log::{debug, info};
use std::collections::BTreeMap;

use super::types::{type_id, DeviceEntry, DeviceKind, RHS2116_PAYLOAD_BYTES};
use crate::error::ConfigurationError;

/// A device known to the registry: catalog row plus its resolved kind
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub entry: DeviceEntry,
    pub kind: DeviceKind,
}

/// Registry of devices indexed by device id.
///
/// Physical devices come from the enumerated device table; logical aggregates
/// (multi-chip acquisition, multi-chip stimulation) are added on top and refer
/// to their members by index.
pub struct DeviceRegistry {
    catalog: BTreeMap<u32, DeviceEntry>,
    devices: BTreeMap<u32, RegisteredDevice>,
    next_logical_index: u32,
}

/// Logical device indices live above any hardware index
const LOGICAL_INDEX_BASE: u32 = 0x1_0000;

impl DeviceRegistry {
    pub fn new(catalog: Vec<DeviceEntry>) -> Self {
        Self {
            catalog: catalog.into_iter().map(|e| (e.device_index, e)).collect(),
            devices: BTreeMap::new(),
            next_logical_index: LOGICAL_INDEX_BASE,
        }
    }

    /// Enumerated device table
    pub fn catalog(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.catalog.values()
    }

    /// Register a physical device from the catalog
    pub fn add_device(&mut self, device_index: u32, heartbeat_hz: f64) -> Result<&RegisteredDevice, ConfigurationError> {
        let entry = self
            .catalog
            .get(&device_index)
            .cloned()
            .ok_or(ConfigurationError::UnknownDevice(device_index))?;

        let kind = match entry.type_id {
            type_id::RHS2116 => {
                if entry.read_size < RHS2116_PAYLOAD_BYTES {
                    return Err(ConfigurationError::Buffer(format!(
                        "device {} frames are {} bytes, RHS2116 needs {}",
                        device_index, entry.read_size, RHS2116_PAYLOAD_BYTES
                    )));
                }
                DeviceKind::Rhs2116 { device_index }
            }
            type_id::HEARTBEAT => DeviceKind::HeartBeat {
                frequency_hz: heartbeat_hz,
            },
            type_id::FMC => DeviceKind::Fmc { port_voltage: 5.0 },
            other => {
                return Err(ConfigurationError::WrongDeviceKind {
                    device: device_index,
                    type_id: other,
                    expected: "Fmc, HeartBeat or Rhs2116",
                })
            }
        };

        debug!("Registered device {} as {}", device_index, kind.name());
        self.devices.insert(device_index, RegisteredDevice { entry, kind });
        Ok(&self.devices[&device_index])
    }

    /// Register every device in the catalog this system understands
    pub fn add_all(&mut self, heartbeat_hz: f64) -> Vec<u32> {
        let indices: Vec<u32> = self.catalog.keys().copied().collect();
        indices
            .into_iter()
            .filter(|idx| self.add_device(*idx, heartbeat_hz).is_ok())
            .collect()
    }

    /// Create a logical multi-chip acquisition device over registered chips
    pub fn add_multi(&mut self, members: Vec<u32>) -> Result<u32, ConfigurationError> {
        self.add_aggregate(members, false)
    }

    /// Create a logical multi-chip stimulator over registered chips
    pub fn add_stim(&mut self, members: Vec<u32>) -> Result<u32, ConfigurationError> {
        self.add_aggregate(members, true)
    }

    fn add_aggregate(&mut self, members: Vec<u32>, stim: bool) -> Result<u32, ConfigurationError> {
        for member in &members {
            match self.devices.get(member) {
                Some(RegisteredDevice {
                    kind: DeviceKind::Rhs2116 { .. },
                    ..
                }) => {}
                Some(dev) => {
                    return Err(ConfigurationError::WrongDeviceKind {
                        device: *member,
                        type_id: dev.entry.type_id,
                        expected: "Rhs2116",
                    })
                }
                None => return Err(ConfigurationError::UnknownDevice(*member)),
            }
        }

        let index = self.next_logical_index;
        self.next_logical_index += 1;

        let kind = if stim {
            DeviceKind::Rhs2116Stim { members }
        } else {
            DeviceKind::Rhs2116Multi { members }
        };
        info!("Created logical {} device {} ({} probes)", kind.name(), index, kind.probe_count());

        let entry = DeviceEntry {
            device_index: index,
            type_id: 0,
            firmware_version: 0,
            read_size: 0,
            write_size: 0,
        };
        self.devices.insert(index, RegisteredDevice { entry, kind });
        Ok(index)
    }

    pub fn get(&self, device_index: u32) -> Option<&RegisteredDevice> {
        self.devices.get(&device_index)
    }

    pub fn devices(&self) -> impl Iterator<Item = &RegisteredDevice> {
        self.devices.values()
    }

    /// Registered chips in ascending index order
    pub fn rhs2116_indices(&self) -> Vec<u32> {
        self.devices
            .values()
            .filter_map(|d| match d.kind {
                DeviceKind::Rhs2116 { device_index } => Some(device_index),
                _ => None,
            })
            .collect()
    }

    pub fn heartbeat_index(&self) -> Option<u32> {
        self.devices
            .values()
            .find(|d| matches!(d.kind, DeviceKind::HeartBeat { .. }))
            .map(|d| d.entry.device_index)
    }

    pub fn fmc_index(&self) -> Option<u32> {
        self.devices
            .values()
            .find(|d| matches!(d.kind, DeviceKind::Fmc { .. }))
            .map(|d| d.entry.device_index)
    }

    /// Members of a logical aggregate, in acquisition order
    pub fn members_of(&self, device_index: u32) -> Option<&[u32]> {
        match &self.devices.get(&device_index)?.kind {
            DeviceKind::Rhs2116Multi { members } | DeviceKind::Rhs2116Stim { members } => {
                Some(members.as_slice())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<DeviceEntry> {
        vec![
            DeviceEntry { device_index: 0, type_id: type_id::FMC, firmware_version: 1, read_size: 0, write_size: 4 },
            DeviceEntry { device_index: 1, type_id: type_id::HEARTBEAT, firmware_version: 1, read_size: 0, write_size: 0 },
            DeviceEntry { device_index: 256, type_id: type_id::RHS2116, firmware_version: 2, read_size: 64, write_size: 0 },
            DeviceEntry { device_index: 257, type_id: type_id::RHS2116, firmware_version: 2, read_size: 64, write_size: 0 },
        ]
    }

    #[test]
    fn test_add_all_resolves_kinds() {
        let mut registry = DeviceRegistry::new(catalog());
        let added = registry.add_all(100.0);
        assert_eq!(added.len(), 4);
        assert_eq!(registry.rhs2116_indices(), vec![256, 257]);
        assert_eq!(registry.heartbeat_index(), Some(1));
        assert_eq!(registry.fmc_index(), Some(0));
    }

    #[test]
    fn test_unknown_device() {
        let mut registry = DeviceRegistry::new(catalog());
        assert_eq!(
            registry.add_device(9, 100.0).unwrap_err(),
            ConfigurationError::UnknownDevice(9)
        );
    }

    #[test]
    fn test_multi_requires_registered_chips() {
        let mut registry = DeviceRegistry::new(catalog());
        registry.add_all(100.0);

        assert!(registry.add_multi(vec![256, 1]).is_err());
        let multi = registry.add_multi(vec![257, 256]).unwrap();
        assert_eq!(registry.members_of(multi), Some(&[257u32, 256][..]));
        assert_eq!(registry.get(multi).unwrap().kind.probe_count(), 32);
    }
}
