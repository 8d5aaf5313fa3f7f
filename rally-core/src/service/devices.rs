//! Device inventories
//!
//! Each task reports the devices visible to it the first time it waits for
//! the cluster; the service merges the per-task inventories into one
//! cluster-wide list in deterministic task order.

use serde::{Deserialize, Serialize};

/// One device reported by a task; opaque to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub kind: String,
}

/// Device inventory of one task, or of the whole cluster after aggregation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInventory {
    pub devices: Vec<DeviceRecord>,
}

impl DeviceInventory {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Append the other inventory's devices, preserving order
    pub fn merge_from(&mut self, other: &DeviceInventory) {
        self.devices.extend(other.devices.iter().cloned());
    }
}

/// Injected hook run on the merged cluster inventory
pub type DeviceAggregator = Box<dyn Fn(DeviceInventory) -> DeviceInventory + Send + Sync>;
