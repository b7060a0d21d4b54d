//! Device registry
//!
//! Process-wide table of exportable devices keyed by bus id. The listener
//! builds OP_REP_DEVLIST straight from [`Registry::list`]; OP_REQ_IMPORT
//! goes through [`Registry::attach`], which enforces the one-importer-at-
//! a-time rule. Sessions hold shared references and never mutate entries.

use protocol::{BusId, DeviceRecord};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use super::host::HostController;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("bus id {0} is already registered")]
    DuplicateBusId(BusId),

    #[error("no exportable device with bus id {0}")]
    NotFound(BusId),

    #[error("device {0} is attached to a session")]
    DeviceBusy(BusId),
}

struct Entry {
    record: DeviceRecord,
    controller: Arc<dyn HostController>,
    attached: bool,
}

/// A device handed to a session by a successful import: the cached record
/// plus the controller handle the dispatcher drives.
#[derive(Clone)]
pub struct AttachedDevice {
    pub record: DeviceRecord,
    pub controller: Arc<dyn HostController>,
}

impl std::fmt::Debug for AttachedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedDevice")
            .field("record", &self.record)
            .finish()
    }
}

/// Table of exportable devices. Listing order is registration order and
/// stays stable for the lifetime of the server.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. Bus ids must be unique among registered devices.
    pub fn register(
        &self,
        record: DeviceRecord,
        controller: Arc<dyn HostController>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.iter().any(|e| e.record.busid == record.busid) {
            return Err(RegistryError::DuplicateBusId(record.busid));
        }
        info!(busid = %record.busid, vendor = format_args!("{:04x}:{:04x}", record.id_vendor, record.id_product), "registered device");
        entries.push(Entry { record, controller, attached: false });
        Ok(())
    }

    /// Remove a device. Fails with `DeviceBusy` while a session is
    /// attached to it.
    pub fn unregister(&self, busid: &BusId) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let idx = entries
            .iter()
            .position(|e| e.record.busid == *busid)
            .ok_or(RegistryError::NotFound(*busid))?;
        if entries[idx].attached {
            return Err(RegistryError::DeviceBusy(*busid));
        }
        entries.remove(idx);
        info!(busid = %busid, "unregistered device");
        Ok(())
    }

    /// Snapshot of all records in registration order.
    pub fn list(&self) -> Vec<DeviceRecord> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.iter().map(|e| e.record.clone()).collect()
    }

    pub fn find(&self, busid: &BusId) -> Option<DeviceRecord> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.iter().find(|e| e.record.busid == *busid).map(|e| e.record.clone())
    }

    /// Claim a device for an importing session.
    pub fn attach(&self, busid: &BusId) -> Result<AttachedDevice, RegistryError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries
            .iter_mut()
            .find(|e| e.record.busid == *busid)
            .ok_or(RegistryError::NotFound(*busid))?;
        if entry.attached {
            return Err(RegistryError::DeviceBusy(*busid));
        }
        entry.attached = true;
        debug!(busid = %busid, "device attached");
        Ok(AttachedDevice { record: entry.record.clone(), controller: entry.controller.clone() })
    }

    /// Release a device when its session ends. Unknown bus ids are
    /// ignored; the entry may have been unplugged meanwhile.
    pub fn detach(&self, busid: &BusId) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.record.busid == *busid) {
            entry.attached = false;
            debug!(busid = %busid, "device detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::MockController;
    use protocol::{DeviceSpeed, InterfaceRecord};

    fn record(busid: &str) -> DeviceRecord {
        DeviceRecord {
            path: format!("/sys/bus/usb/devices/{busid}"),
            busid: BusId::new(busid).unwrap(),
            busnum: 1,
            devnum: 2,
            speed: DeviceSpeed::High,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![InterfaceRecord { class: 3, subclass: 0, protocol: 0 }],
        }
    }

    fn controller() -> Arc<dyn HostController> {
        Arc::new(MockController::new(Vec::new()))
    }

    #[test]
    fn find_returns_registered_record() {
        let registry = Registry::new();
        registry.register(record("1-1"), controller()).unwrap();

        let found = registry.find(&BusId::new("1-1").unwrap()).unwrap();
        assert_eq!(found, record("1-1"));
        assert!(registry.find(&BusId::new("2-1").unwrap()).is_none());
    }

    #[test]
    fn list_preserves_registration_order() {
        let registry = Registry::new();
        registry.register(record("1-1"), controller()).unwrap();
        registry.register(record("1-2"), controller()).unwrap();
        registry.register(record("2-1"), controller()).unwrap();

        let busids: Vec<String> = registry.list().iter().map(|r| r.busid.to_string()).collect();
        assert_eq!(busids, ["1-1", "1-2", "2-1"]);
    }

    #[test]
    fn duplicate_busid_is_rejected() {
        let registry = Registry::new();
        registry.register(record("1-1"), controller()).unwrap();
        let err = registry.register(record("1-1"), controller()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateBusId(_)));
    }

    #[test]
    fn attach_is_exclusive() {
        let registry = Registry::new();
        registry.register(record("1-1"), controller()).unwrap();
        let busid = BusId::new("1-1").unwrap();

        registry.attach(&busid).unwrap();
        assert_eq!(registry.attach(&busid).unwrap_err(), RegistryError::DeviceBusy(busid));

        registry.detach(&busid);
        assert!(registry.attach(&busid).is_ok());
    }

    #[test]
    fn unregister_refuses_attached_device() {
        let registry = Registry::new();
        registry.register(record("1-1"), controller()).unwrap();
        let busid = BusId::new("1-1").unwrap();

        registry.attach(&busid).unwrap();
        assert_eq!(registry.unregister(&busid).unwrap_err(), RegistryError::DeviceBusy(busid));

        registry.detach(&busid);
        registry.unregister(&busid).unwrap();
        assert!(registry.find(&busid).is_none());
    }

    #[test]
    fn attach_missing_device_reports_not_found() {
        let registry = Registry::new();
        let busid = BusId::new("3-1").unwrap();
        assert_eq!(registry.attach(&busid).unwrap_err(), RegistryError::NotFound(busid));
    }
}
