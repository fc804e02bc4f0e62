//! Data-item registry
//!
//! A read-only index over the device model. Built once at startup from the
//! model supplied by the loader, frozen before any I/O begins, and shared
//! behind an `Arc` so lookups need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data_item::DataItem;
use crate::error::ModelError;
use crate::Result;

/// A top-level machine in the device model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub data_items: Vec<DataItem>,
}

#[derive(Debug, Deserialize)]
struct DeviceModelFile {
    devices: Vec<Device>,
}

/// Index of devices and data items by id, name, and source
#[derive(Debug, Default)]
pub struct DataItemRegistry {
    devices: Vec<Arc<Device>>,
    device_by_key: HashMap<String, Arc<Device>>,
    items_by_id: HashMap<String, Arc<DataItem>>,
    item_device: HashMap<String, Arc<Device>>,
    device_items: HashMap<String, HashMap<String, Arc<DataItem>>>,
}

impl DataItemRegistry {
    /// Build the registry from parsed devices, rejecting duplicate ids.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        let mut registry = DataItemRegistry::default();

        for device in devices {
            let device = Arc::new(device);
            for key in [&device.uuid, &device.name, &device.id] {
                if registry
                    .device_by_key
                    .insert(key.clone(), Arc::clone(&device))
                    .is_some_and(|prev| !Arc::ptr_eq(&prev, &device))
                {
                    return Err(ModelError::DuplicateId { id: key.clone() });
                }
            }

            let mut items = HashMap::new();
            for di in &device.data_items {
                let di = Arc::new(di.clone());
                if registry
                    .items_by_id
                    .insert(di.id.clone(), Arc::clone(&di))
                    .is_some()
                {
                    return Err(ModelError::DuplicateId { id: di.id.clone() });
                }
                registry
                    .item_device
                    .insert(di.id.clone(), Arc::clone(&device));

                items.insert(di.id.clone(), Arc::clone(&di));
                if let Some(name) = &di.name {
                    items.insert(name.clone(), Arc::clone(&di));
                }
                if let Some(source) = &di.source {
                    items.insert(source.clone(), Arc::clone(&di));
                }
            }
            registry.device_items.insert(device.uuid.clone(), items);
            registry.devices.push(device);
        }

        Ok(registry)
    }

    /// Parse a JSON device model document and build the registry.
    pub fn load_json(raw: &str) -> Result<Self> {
        let file: DeviceModelFile = serde_json::from_str(raw)?;
        Self::from_devices(file.devices)
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// The device adapter data lands on when no device is named
    pub fn default_device(&self) -> Option<&Arc<Device>> {
        self.devices.first()
    }

    /// Resolve a device by uuid, name, or id
    pub fn find_device(&self, key: &str) -> Option<&Arc<Device>> {
        self.device_by_key.get(key)
    }

    /// The device owning a data item
    pub fn device_of(&self, data_item_id: &str) -> Option<&Arc<Device>> {
        self.item_device.get(data_item_id)
    }

    /// Resolve a data item by id, name, or source, optionally scoped to a
    /// device. Unscoped lookups try the id index first, then every device
    /// in model order.
    pub fn find_data_item(&self, device: Option<&str>, key: &str) -> Option<Arc<DataItem>> {
        match device {
            Some(dev) => {
                let device = self.find_device(dev)?;
                self.device_items.get(&device.uuid)?.get(key).cloned()
            }
            None => {
                if let Some(di) = self.items_by_id.get(key) {
                    return Some(Arc::clone(di));
                }
                for device in &self.devices {
                    if let Some(di) =
                        self.device_items.get(&device.uuid).and_then(|m| m.get(key))
                    {
                        return Some(Arc::clone(di));
                    }
                }
                None
            }
        }
    }

    /// First data item of a given type on a device (e.g. ASSET_CHANGED)
    pub fn find_by_type(&self, device_uuid: &str, type_: &str) -> Option<Arc<DataItem>> {
        let device = self.device_by_key.get(device_uuid)?;
        device
            .data_items
            .iter()
            .find(|di| di.type_.eq_ignore_ascii_case(type_))
            .map(|di| Arc::new(di.clone()))
    }

    /// Visit every data item in the model
    pub fn each_data_item(&self, mut f: impl FnMut(&Arc<DataItem>)) {
        for device in &self.devices {
            if let Some(items) = self.device_items.get(&device.uuid) {
                // Iterate by declared order, not map order
                for di in &device.data_items {
                    if let Some(item) = items.get(&di.id) {
                        f(item);
                    } else {
                        warn!(id = %di.id, "data item missing from index");
                    }
                }
            }
        }
    }
}
