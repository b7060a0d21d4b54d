//! Device enumeration
//!
//! Scans the host for attached USB devices at startup, builds the cached
//! device record for each one and registers it together with an opened
//! rusb backend. Exports are rebuilt on every start; nothing is persisted.

use anyhow::{Context as _, Result};
use protocol::{BusId, DeviceRecord, DeviceSpeed, InterfaceRecord};
use rusb::{Context, Device, UsbContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::libusb::UsbHostDevice;
use super::registry::Registry;

/// Scan the bus and register every exportable device that passes the
/// configured VID:PID filters. Returns the number of devices registered.
pub fn register_attached_devices(registry: &Registry, filters: &[String]) -> Result<usize> {
    let context = Context::new().context("libusb context creation failed")?;
    let devices = context.devices().context("device list unavailable")?;

    let mut registered = 0;
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("skipping device without readable descriptor: {e}");
                continue;
            }
        };

        // Hubs cannot be exported.
        if descriptor.class_code() == 0x09 {
            continue;
        }
        if !matches_filters(filters, descriptor.vendor_id(), descriptor.product_id()) {
            debug!(
                "skipping {:04x}:{:04x}: not matched by filters",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            continue;
        }

        let busid = format!("{}-{}", device.bus_number(), device.address());
        let record = match build_record(&device, &busid) {
            Ok(record) => record,
            Err(e) => {
                debug!(busid = %busid, "skipping device: {e:#}");
                continue;
            }
        };

        let backend = match UsbHostDevice::open(&device) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(busid = %busid, "device not exportable: {e}");
                continue;
            }
        };

        match registry.register(record, Arc::new(backend)) {
            Ok(()) => registered += 1,
            Err(e) => warn!(busid = %busid, "registration failed: {e}"),
        }
    }

    info!("{registered} device(s) exportable");
    Ok(registered)
}

fn build_record(device: &Device<Context>, busid: &str) -> Result<DeviceRecord> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor().context("device has no active configuration")?;

    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().next())
        .map(|alt| InterfaceRecord {
            class: alt.class_code(),
            subclass: alt.sub_class_code(),
            protocol: alt.protocol_code(),
        })
        .collect();

    let version = descriptor.device_version();
    let bcd_device = (version.major() as u16) << 8
        | (version.minor() as u16) << 4
        | version.sub_minor() as u16;

    Ok(DeviceRecord {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid: BusId::new(busid)?,
        busnum: device.bus_number() as u32,
        devnum: device.address() as u32,
        speed: map_speed(device.speed()),
        id_vendor: descriptor.vendor_id(),
        id_product: descriptor.product_id(),
        bcd_device,
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        configuration_value: config.number(),
        num_configurations: descriptor.num_configurations(),
        interfaces,
    })
}

fn map_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => DeviceSpeed::Super,
        _ => DeviceSpeed::Unknown,
    }
}

/// Match a device against the configured `VID:PID` patterns. An empty
/// filter list exports everything; `*` wildcards either side.
fn matches_filters(filters: &[String], vendor_id: u16, product_id: u16) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        let Some((vid, pid)) = filter.split_once(':') else {
            warn!(filter = %filter, "ignoring malformed device filter");
            return false;
        };
        matches_id(vid, vendor_id) && matches_id(pid, product_id)
    })
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let digits = pattern.strip_prefix("0x").or_else(|| pattern.strip_prefix("0X")).unwrap_or(pattern);
    u16::from_str_radix(digits, 16).map(|wanted| wanted == id).unwrap_or(false)
}
