//! rusb host-controller backend
//!
//! Implements [`HostController`] on top of rusb's synchronous transfer
//! API. Submits are non-blocking: each accepted transfer is handed to a
//! small pool of dedicated worker threads that perform the blocking
//! libusb call and then invoke the completion callback, so completions
//! arrive from a controller-owned thread exactly like an interrupt-driven
//! backend.
//!
//! Cancellation is endpoint-level: `endpoint_clear` calls `clear_halt`
//! and marks the endpoint, and a worker whose blocking call fails while
//! the mark is set reports the transfer as `Canceled` rather than failed.

use protocol::SetupPacket;
use rusb::{Context, Device, DeviceHandle};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::host::{
    Completion, EndpointInfo, EndpointKind, HostController, HostError, IsoPacket, Transfer,
    TransferStatus,
};

/// Blocking-call timeout. The engine imposes no per-URB timeout; this only
/// bounds how long a worker thread can be stuck on a dead device.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt IN polls use a shorter cycle. USB/IP importers keep an
/// interrupt URB permanently in flight; a timed-out poll is re-reported as
/// an empty completion and the importer resubmits immediately.
const INTERRUPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker threads per device: the bulk concurrency cap worth of streams
/// plus headroom for control and interrupt traffic.
const TRANSFER_WORKERS: usize = 6;

struct Job {
    transfer: Transfer,
    complete: Completion,
    control: bool,
}

/// One opened USB device driven through rusb.
pub struct UsbHostDevice {
    handle: Arc<DeviceHandle<Context>>,
    endpoints: Vec<EndpointInfo>,
    jobs: async_channel::Sender<Job>,
    canceled: Arc<Mutex<HashSet<u8>>>,
}

impl UsbHostDevice {
    /// Open `device`, claim its interfaces and start the transfer workers.
    pub fn open(device: &Device<Context>) -> Result<Self, HostError> {
        let mut handle = device.open().map_err(backend_error)?;
        if handle.set_auto_detach_kernel_driver(true).is_err() {
            trace!("auto-detach of kernel drivers not supported on this platform");
        }

        let config = device.active_config_descriptor().map_err(backend_error)?;
        let mut endpoints = Vec::new();
        for interface in config.interfaces() {
            if let Err(e) = handle.claim_interface(interface.number()) {
                warn!(interface = interface.number(), "could not claim interface: {e}");
            }
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    endpoints.push(EndpointInfo {
                        address: endpoint.address(),
                        max_packet_size: endpoint.max_packet_size(),
                        kind: map_transfer_type(endpoint.transfer_type()),
                    });
                }
            }
        }

        let handle = Arc::new(handle);
        let canceled = Arc::new(Mutex::new(HashSet::new()));
        let (jobs, job_rx) = async_channel::bounded::<Job>(64);
        for worker in 0..TRANSFER_WORKERS {
            let handle = handle.clone();
            let job_rx = job_rx.clone();
            let canceled = canceled.clone();
            let endpoints = endpoints.clone();
            std::thread::Builder::new()
                .name(format!("usb-xfer-{worker}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv_blocking() {
                        run_job(&handle, &endpoints, &canceled, job);
                    }
                })
                .map_err(|e| HostError::Backend(e.to_string()))?;
        }

        Ok(Self { handle, endpoints, jobs, canceled })
    }

    fn enqueue(&self, transfer: Transfer, complete: Completion, control: bool) -> Result<(), HostError> {
        let endpoint = transfer.endpoint;
        match self.jobs.try_send(Job { transfer, complete, control }) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => Err(HostError::SubmitFailed(endpoint)),
            Err(async_channel::TrySendError::Closed(_)) => Err(HostError::NoDevice),
        }
    }
}

impl HostController for UsbHostDevice {
    fn alloc_transfer(&self, data_capacity: usize, iso_count: usize) -> Result<Transfer, HostError> {
        let mut data = Vec::new();
        data.try_reserve_exact(data_capacity).map_err(|_| HostError::OutOfMemory(data_capacity))?;
        data.resize(data_capacity, 0);
        Ok(Transfer {
            data,
            num_bytes: 0,
            actual_num_bytes: 0,
            status: TransferStatus::Completed,
            endpoint: 0,
            flags: Default::default(),
            iso_packets: vec![
                IsoPacket {
                    offset: 0,
                    num_bytes: 0,
                    actual_num_bytes: 0,
                    status: TransferStatus::Completed,
                };
                iso_count
            ],
        })
    }

    fn submit_control(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError> {
        self.enqueue(transfer, complete, true)
    }

    fn submit(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError> {
        self.enqueue(transfer, complete, false)
    }

    fn endpoint_clear(&self, endpoint: u8) -> Result<(), HostError> {
        self.canceled.lock().expect("cancel set lock poisoned").insert(endpoint);
        self.handle.clear_halt(endpoint).map_err(|e| {
            warn!(endpoint = format_args!("{endpoint:#04x}"), "clear_halt failed: {e}");
            backend_error(e)
        })
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.clone()
    }
}

fn run_job(
    handle: &DeviceHandle<Context>,
    endpoints: &[EndpointInfo],
    canceled: &Mutex<HashSet<u8>>,
    job: Job,
) {
    let Job { mut transfer, complete, control } = job;

    let result = if control {
        run_control(handle, &mut transfer)
    } else {
        match endpoints.iter().find(|e| e.address == transfer.endpoint).map(|e| e.kind) {
            Some(EndpointKind::Bulk) => run_bulk(handle, endpoints, &mut transfer),
            Some(EndpointKind::Interrupt) => run_interrupt(handle, &mut transfer),
            Some(EndpointKind::Isochronous) => run_isochronous(&mut transfer),
            _ => {
                warn!(endpoint = format_args!("{:#04x}", transfer.endpoint), "submit on unknown endpoint");
                Err(rusb::Error::NotFound)
            }
        }
    };

    transfer.status = match result {
        Ok(()) => TransferStatus::Completed,
        Err(e) => {
            let was_canceled =
                { canceled.lock().expect("cancel set lock poisoned").remove(&transfer.endpoint) };
            if was_canceled {
                TransferStatus::Canceled
            } else {
                map_rusb_error(e)
            }
        }
    };

    complete(transfer);
}

fn run_control(handle: &DeviceHandle<Context>, transfer: &mut Transfer) -> rusb::Result<()> {
    let setup_bytes: [u8; SetupPacket::SIZE] =
        transfer.data[..SetupPacket::SIZE].try_into().expect("buffer shorter than a setup packet");
    let setup = SetupPacket::from_bytes(&setup_bytes);
    trace!(
        "control transfer: request_type={:#04x} request={:#04x} value={:#06x} index={:#06x} length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    // wLength can disagree with the URB's buffer length; the buffer wins.
    let end = (SetupPacket::SIZE + setup.length as usize).min(transfer.data.len());

    if setup.is_in() {
        let buf = &mut transfer.data[SetupPacket::SIZE..end];
        let n = handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            DEFAULT_TIMEOUT,
        )?;
        transfer.actual_num_bytes = SetupPacket::SIZE + n;
    } else {
        let buf = &transfer.data[SetupPacket::SIZE..end];
        let n = handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            DEFAULT_TIMEOUT,
        )?;
        transfer.actual_num_bytes = SetupPacket::SIZE + n;
    }
    Ok(())
}

fn run_bulk(
    handle: &DeviceHandle<Context>,
    endpoints: &[EndpointInfo],
    transfer: &mut Transfer,
) -> rusb::Result<()> {
    let endpoint = transfer.endpoint;
    if endpoint & 0x80 != 0 {
        let buf = &mut transfer.data[..transfer.num_bytes];
        let n = handle.read_bulk(endpoint, buf, DEFAULT_TIMEOUT)?;
        transfer.actual_num_bytes = n;
    } else {
        let buf = &transfer.data[..transfer.num_bytes];
        let n = handle.write_bulk(endpoint, buf, DEFAULT_TIMEOUT)?;
        transfer.actual_num_bytes = n;
        // A transfer that fills its final packet needs an explicit
        // zero-length packet when the importer asked for one.
        let max_packet = endpoints
            .iter()
            .find(|e| e.address == endpoint)
            .map(|e| e.max_packet_size as usize)
            .unwrap_or(0);
        if transfer.flags.zero_packet && n > 0 && max_packet > 0 && n % max_packet == 0 {
            handle.write_bulk(endpoint, &[], DEFAULT_TIMEOUT)?;
        }
    }
    Ok(())
}

fn run_interrupt(handle: &DeviceHandle<Context>, transfer: &mut Transfer) -> rusb::Result<()> {
    let endpoint = transfer.endpoint;
    if endpoint & 0x80 != 0 {
        let buf = &mut transfer.data[..transfer.num_bytes];
        match handle.read_interrupt(endpoint, buf, INTERRUPT_POLL_TIMEOUT) {
            Ok(n) => {
                if n > 0 {
                    trace!(
                        "interrupt IN ep={endpoint:#04x} len={n} data={:02x?}",
                        &transfer.data[..n.min(16)]
                    );
                }
                transfer.actual_num_bytes = n;
                Ok(())
            }
            // An empty poll cycle: the importer resubmits on the empty
            // completion, which is how HID polling is expected to behave.
            Err(rusb::Error::Timeout) => {
                transfer.actual_num_bytes = 0;
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        let buf = &transfer.data[..transfer.num_bytes];
        let n = handle.write_interrupt(endpoint, buf, DEFAULT_TIMEOUT)?;
        transfer.actual_num_bytes = n;
        Ok(())
    }
}

/// rusb exposes no synchronous isochronous API, so iso URBs complete
/// without touching the bus: IN reports empty packets, OUT accepts the
/// payload. Streaming devices need an async-transfer backend.
fn run_isochronous(transfer: &mut Transfer) -> rusb::Result<()> {
    let is_in = transfer.endpoint & 0x80 != 0;
    debug!(
        "isochronous transfer simulated: ep={:#04x} packets={} is_in={is_in}",
        transfer.endpoint,
        transfer.iso_packets.len()
    );
    for packet in &mut transfer.iso_packets {
        packet.status = TransferStatus::Completed;
        packet.actual_num_bytes = if is_in { 0 } else { packet.num_bytes };
    }
    transfer.actual_num_bytes = if is_in { 0 } else { transfer.num_bytes };
    Ok(())
}

fn map_transfer_type(t: rusb::TransferType) -> EndpointKind {
    match t {
        rusb::TransferType::Control => EndpointKind::Control,
        rusb::TransferType::Bulk => EndpointKind::Bulk,
        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
    }
}

/// Map a rusb error onto the controller status the dispatcher consumes.
fn map_rusb_error(e: rusb::Error) -> TransferStatus {
    match e {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn backend_error(e: rusb::Error) -> HostError {
    match e {
        rusb::Error::NoDevice => HostError::NoDevice,
        rusb::Error::NoMem => HostError::OutOfMemory(0),
        other => HostError::Backend(other.to_string()),
    }
}
