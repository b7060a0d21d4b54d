//! URB dispatcher
//!
//! Turns each CMD_SUBMIT into controller transfers and produces exactly
//! one reply frame per accepted URB: a RET_SUBMIT, or a RET_UNLINK when a
//! matching CMD_UNLINK arrived while the URB was still in flight.
//!
//! The dispatcher runs between three contexts. The session's reader task
//! calls [`UrbDispatcher::submit`] and [`UrbDispatcher::unlink`];
//! controller worker threads deliver completions into
//! [`UrbDispatcher::on_complete`]; chunked bulk reads run on their own
//! spawned task. The seqnum table and the pending-unlink table share one
//! mutex so that a completion's table removal and its unlink lookup are a
//! single atomic step, which is what pins the RET_SUBMIT-vs-RET_UNLINK
//! decision in the cancellation races.

use async_channel::Sender;
use protocol::{
    CmdSubmit, CmdUnlink, Direction, IsoPacketDescriptor, RetSubmit, RetUnlink, SetupPacket,
    URB_ZERO_PACKET, UrbStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::engine::tweaks;
use crate::usb::host::{write_setup, Transfer, TransferFlags};
use crate::usb::{AttachedDevice, EndpointInfo, EndpointKind, TransferStatus};

/// In-flight bulk transfers allowed per session before new bulk submits
/// are answered with EPIPE backpressure.
pub const MAX_CONCURRENT_BULK: usize = 4;

/// Bulk IN requests above this size take the chunked path.
pub const CHUNK_THRESHOLD: u32 = 32 * 1024;

/// Size of one chunked sub-transfer, before max-packet rounding.
pub const CHUNK_SIZE: u32 = 32 * 1024;

/// Hard cap for a single (non-chunked) controller transfer.
pub const MAX_TRANSFER_SIZE: u32 = 64 * 1024;

/// Free-memory low-water mark below which all in-flight transfers are
/// force-cancelled.
pub const LOW_MEMORY_WATERMARK: usize = 10 * 1024;

/// Minimum spacing between free-memory probes.
pub const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-URB bookkeeping kept while the transfer is with the controller.
/// The controller owns the transfer object itself until the completion
/// hands it back.
#[derive(Debug, Clone, Copy)]
struct UrbContext {
    kind: EndpointKind,
    direction: Direction,
    /// Buffer length the importer asked for.
    requested_len: u32,
    /// Counted against `bulk_in_flight`.
    counts_as_bulk: bool,
}

#[derive(Default)]
struct Tables {
    /// seqnum -> context; an entry exists iff no reply has been emitted.
    in_flight: HashMap<u32, UrbContext>,
    /// target seqnum -> the unlink's own seqnum.
    pending_unlinks: HashMap<u32, u32>,
}

/// Per-session URB dispatcher. One instance per attached session, shared
/// with controller callbacks via `Arc`.
pub struct UrbDispatcher {
    device: AttachedDevice,
    endpoints: Vec<EndpointInfo>,
    replies: Sender<Vec<u8>>,
    tables: Mutex<Tables>,
    bulk_in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    device_gone: AtomicBool,
    last_memory_check: Mutex<Option<Instant>>,
    /// Submissions hold this shared; `endpoint_clear` sweeps hold it
    /// exclusive, so a cancel never interleaves with a submit in flight.
    cancel_gate: RwLock<()>,
}

impl UrbDispatcher {
    pub fn new(device: AttachedDevice, replies: Sender<Vec<u8>>) -> Arc<Self> {
        let endpoints = device.controller.endpoints();
        Arc::new(Self {
            device,
            endpoints,
            replies,
            tables: Mutex::new(Tables::default()),
            bulk_in_flight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            device_gone: AtomicBool::new(false),
            last_memory_check: Mutex::new(None),
            cancel_gate: RwLock::new(()),
        })
    }

    pub fn controller(&self) -> &Arc<dyn crate::usb::HostController> {
        &self.device.controller
    }

    /// Route one CMD_SUBMIT. Every path through here either registers an
    /// in-flight context or enqueues an immediate reply.
    pub async fn submit(self: &Arc<Self>, cmd: CmdSubmit) {
        if self.device_gone.load(Ordering::Acquire) {
            self.enqueue(
                RetSubmit::with_status(cmd.seqnum, UrbStatus::Eshutdown.code(), Vec::new())
                    .to_bytes(),
            )
            .await;
            return;
        }

        if cmd.ep == 0 {
            self.submit_control(cmd).await;
            return;
        }

        let address = endpoint_address(cmd.ep, cmd.direction);
        let Some(endpoint) = self.endpoint_info(address) else {
            warn!(endpoint = format_args!("{address:#04x}"), "submit on unknown endpoint");
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
            return;
        };

        match endpoint.kind {
            EndpointKind::Bulk => self.submit_bulk(cmd, endpoint).await,
            EndpointKind::Interrupt => self.submit_interrupt(cmd, endpoint).await,
            EndpointKind::Isochronous => self.submit_isochronous(cmd, endpoint).await,
            EndpointKind::Control => {
                warn!(endpoint = format_args!("{address:#04x}"), "control transfer on non-default endpoint");
                self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
            }
        }
    }

    async fn submit_control(self: &Arc<Self>, cmd: CmdSubmit) {
        let setup = SetupPacket::from_bytes(&cmd.setup);
        trace!(
            "control urb seq={} request_type={:#04x} request={:#04x} length={}",
            cmd.seqnum, setup.request_type, setup.request, setup.length
        );

        if tweaks::apply(self, cmd.seqnum, &setup).await {
            return;
        }

        let capacity = SetupPacket::SIZE + cmd.transfer_buffer_length as usize;
        let mut transfer = match self.device.controller.alloc_transfer(capacity, 0) {
            Ok(t) => t,
            Err(e) => {
                warn!("control transfer allocation failed: {e}");
                self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
                return;
            }
        };

        write_setup(&mut transfer, &setup);
        if !setup.is_in() && !cmd.data.is_empty() {
            let room = transfer.data.len() - SetupPacket::SIZE;
            let n = cmd.data.len().min(room);
            transfer.data[SetupPacket::SIZE..SetupPacket::SIZE + n].copy_from_slice(&cmd.data[..n]);
        }
        transfer.num_bytes = SetupPacket::SIZE + setup.length as usize;
        transfer.endpoint = if setup.is_in() { 0x80 } else { 0x00 };
        transfer.flags = translate_flags(cmd.transfer_flags);

        self.insert_context(
            cmd.seqnum,
            UrbContext {
                kind: EndpointKind::Control,
                direction: cmd.direction,
                requested_len: cmd.transfer_buffer_length,
                counts_as_bulk: false,
            },
        );

        let result = {
            let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
            self.device.controller.submit_control(transfer, self.completion(cmd.seqnum))
        };
        if let Err(e) = result {
            warn!(seqnum = cmd.seqnum, "control submit failed: {e}");
            self.remove_context(cmd.seqnum);
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
        }
    }

    async fn submit_bulk(self: &Arc<Self>, cmd: CmdSubmit, endpoint: EndpointInfo) {
        self.check_memory_pressure();

        let requested = cmd.transfer_buffer_length;
        if cmd.direction.is_in() && requested == 0 {
            self.enqueue(RetSubmit::with_data(cmd.seqnum, Vec::new()).to_bytes()).await;
            return;
        }

        if self.bulk_in_flight.load(Ordering::Acquire) >= MAX_CONCURRENT_BULK {
            debug!(seqnum = cmd.seqnum, "bulk concurrency cap reached, pushing back");
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
            return;
        }
        self.bulk_in_flight.fetch_add(1, Ordering::AcqRel);

        let context = UrbContext {
            kind: EndpointKind::Bulk,
            direction: cmd.direction,
            requested_len: requested,
            counts_as_bulk: true,
        };

        if cmd.direction.is_in() && requested > CHUNK_THRESHOLD {
            self.insert_context(cmd.seqnum, context);
            let dispatcher = Arc::clone(self);
            let flags = translate_flags(cmd.transfer_flags);
            tokio::spawn(async move {
                dispatcher
                    .run_chunked_bulk_in(
                        cmd.seqnum,
                        endpoint.address,
                        endpoint.max_packet_size,
                        requested,
                        flags,
                    )
                    .await;
            });
            return;
        }

        let adjusted = requested.min(MAX_TRANSFER_SIZE);
        let submitted = if cmd.direction.is_in() {
            round_to_packet(adjusted, endpoint.max_packet_size).min(MAX_TRANSFER_SIZE)
        } else {
            adjusted
        };

        let mut transfer = match self.device.controller.alloc_transfer(submitted as usize, 0) {
            Ok(t) => t,
            Err(e) => {
                warn!(seqnum = cmd.seqnum, "bulk transfer allocation failed: {e}");
                self.release_bulk_slot();
                self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
                return;
            }
        };
        if !cmd.direction.is_in() && !cmd.data.is_empty() {
            let n = cmd.data.len().min(submitted as usize);
            transfer.data[..n].copy_from_slice(&cmd.data[..n]);
        }
        transfer.num_bytes = submitted as usize;
        transfer.endpoint = endpoint.address;
        transfer.flags = translate_flags(cmd.transfer_flags);

        self.insert_context(cmd.seqnum, context);
        let result = {
            let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
            self.device.controller.submit(transfer, self.completion(cmd.seqnum))
        };
        if let Err(e) = result {
            warn!(seqnum = cmd.seqnum, "bulk submit failed: {e}");
            self.remove_context(cmd.seqnum);
            self.release_bulk_slot();
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
        }
    }

    async fn submit_interrupt(self: &Arc<Self>, cmd: CmdSubmit, endpoint: EndpointInfo) {
        let requested = cmd.transfer_buffer_length;
        if cmd.direction.is_in() && requested == 0 {
            self.enqueue(RetSubmit::with_data(cmd.seqnum, Vec::new()).to_bytes()).await;
            return;
        }

        let submitted = if cmd.direction.is_in() {
            round_to_packet(requested, endpoint.max_packet_size)
        } else {
            requested
        };

        let mut transfer = match self.device.controller.alloc_transfer(submitted as usize, 0) {
            Ok(t) => t,
            Err(e) => {
                warn!(seqnum = cmd.seqnum, "interrupt transfer allocation failed: {e}");
                self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
                return;
            }
        };
        if !cmd.direction.is_in() && !cmd.data.is_empty() {
            let n = cmd.data.len().min(submitted as usize);
            transfer.data[..n].copy_from_slice(&cmd.data[..n]);
        }
        transfer.num_bytes = submitted as usize;
        transfer.endpoint = endpoint.address;
        transfer.flags = translate_flags(cmd.transfer_flags);

        self.insert_context(
            cmd.seqnum,
            UrbContext {
                kind: EndpointKind::Interrupt,
                direction: cmd.direction,
                requested_len: requested,
                counts_as_bulk: false,
            },
        );
        let result = {
            let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
            self.device.controller.submit(transfer, self.completion(cmd.seqnum))
        };
        if let Err(e) = result {
            warn!(seqnum = cmd.seqnum, "interrupt submit failed: {e}");
            self.remove_context(cmd.seqnum);
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
        }
    }

    async fn submit_isochronous(self: &Arc<Self>, cmd: CmdSubmit, endpoint: EndpointInfo) {
        let requested = cmd.transfer_buffer_length;
        let mut transfer = match self
            .device
            .controller
            .alloc_transfer(requested as usize, cmd.iso_descriptors.len())
        {
            Ok(t) => t,
            Err(e) => {
                warn!(seqnum = cmd.seqnum, "iso transfer allocation failed: {e}");
                self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
                return;
            }
        };
        if !cmd.direction.is_in() && !cmd.data.is_empty() {
            let n = cmd.data.len().min(requested as usize);
            transfer.data[..n].copy_from_slice(&cmd.data[..n]);
        }
        for (packet, descriptor) in transfer.iso_packets.iter_mut().zip(&cmd.iso_descriptors) {
            packet.offset = descriptor.offset;
            packet.num_bytes = descriptor.length;
            packet.actual_num_bytes = 0;
            packet.status = TransferStatus::Completed;
        }
        transfer.num_bytes = requested as usize;
        transfer.endpoint = endpoint.address;
        transfer.flags = translate_flags(cmd.transfer_flags);

        self.insert_context(
            cmd.seqnum,
            UrbContext {
                kind: EndpointKind::Isochronous,
                direction: cmd.direction,
                requested_len: requested,
                counts_as_bulk: false,
            },
        );
        let result = {
            let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
            self.device.controller.submit(transfer, self.completion(cmd.seqnum))
        };
        if let Err(e) = result {
            warn!(seqnum = cmd.seqnum, "iso submit failed: {e}");
            self.remove_context(cmd.seqnum);
            self.enqueue(RetSubmit::epipe(cmd.seqnum).to_bytes()).await;
        }
    }

    /// Chunked bulk IN: read at most `CHUNK_SIZE` per sub-transfer and
    /// aggregate until a short packet, an error, or the requested length.
    async fn run_chunked_bulk_in(
        self: Arc<Self>,
        seqnum: u32,
        address: u8,
        max_packet_size: u16,
        requested: u32,
        flags: TransferFlags,
    ) {
        let mut aggregated = Vec::new();
        if aggregated.try_reserve_exact(requested as usize).is_err() {
            warn!(seqnum, requested, "aggregate buffer allocation failed");
            self.finish_chunked(seqnum, None, Vec::new()).await;
            return;
        }

        let mut remaining = requested as usize;
        let mut status = TransferStatus::Completed;

        while remaining > 0 {
            let this_chunk =
                round_to_packet(CHUNK_SIZE.min(remaining as u32), max_packet_size) as usize;

            let mut transfer = match self.device.controller.alloc_transfer(this_chunk, 0) {
                Ok(t) => t,
                Err(e) => {
                    warn!(seqnum, this_chunk, "chunk allocation failed: {e}");
                    self.finish_chunked(seqnum, None, Vec::new()).await;
                    return;
                }
            };
            transfer.num_bytes = this_chunk;
            transfer.endpoint = address;
            transfer.flags = flags;

            let (tx, rx) = oneshot::channel();
            let result = {
                let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
                self.device.controller.submit(
                    transfer,
                    Box::new(move |t| {
                        let _ = tx.send(t);
                    }),
                )
            };
            if let Err(e) = result {
                warn!(seqnum, "chunk submit failed: {e}");
                self.finish_chunked(seqnum, None, Vec::new()).await;
                return;
            }

            let done = match rx.await {
                Ok(t) => t,
                Err(_) => {
                    warn!(seqnum, "chunk completion dropped by controller");
                    self.finish_chunked(seqnum, None, Vec::new()).await;
                    return;
                }
            };

            if done.status != TransferStatus::Completed {
                status = done.status;
                if done.status == TransferStatus::NoDevice {
                    self.device_gone.store(true, Ordering::Release);
                }
                break;
            }

            let actual = done.actual_num_bytes;
            if actual == 0 {
                break;
            }
            let to_copy = actual.min(remaining);
            aggregated.extend_from_slice(&done.data[..to_copy]);
            remaining -= to_copy;
            if actual < this_chunk {
                // Short packet: the device has nothing more to say.
                break;
            }
        }

        self.finish_chunked(seqnum, Some(status), aggregated).await;
    }

    /// Terminate a chunked sequence: resolve the unlink race, emit the
    /// single reply and release the bulk slot. `status: None` means a
    /// chunk could not be allocated or submitted, which surfaces as EPIPE
    /// with no payload.
    async fn finish_chunked(&self, seqnum: u32, status: Option<TransferStatus>, data: Vec<u8>) {
        let (context, unlink) = {
            let mut tables = self.tables.lock().expect("urb tables poisoned");
            (tables.in_flight.remove(&seqnum), tables.pending_unlinks.remove(&seqnum))
        };
        let Some(context) = context else {
            // Reaped by shutdown or the memory sweep; counters were reset
            // along with the table.
            return;
        };

        if !self.shutting_down.load(Ordering::Acquire) {
            let frame = match (unlink, status) {
                (Some(unlink_seqnum), status) => {
                    let code =
                        status.map_or(UrbStatus::Epipe, TransferStatus::to_urb_status).code();
                    info!(seqnum, unlink_seqnum, code, "chunked urb unlinked");
                    RetUnlink::new(unlink_seqnum, code).to_bytes()
                }
                (None, Some(status)) => {
                    RetSubmit::with_status(seqnum, status.to_urb_status().code(), data).to_bytes()
                }
                (None, None) => RetSubmit::epipe(seqnum).to_bytes(),
            };
            self.enqueue(frame).await;
        }

        if context.counts_as_bulk {
            self.release_bulk_slot();
        }
    }

    /// Record the unlink and cancel outstanding transfers. No reply is
    /// emitted here; the completion of the target produces RET_UNLINK.
    ///
    /// When the target has already completed (its context is gone) the
    /// unlink is dropped: the reply on the wire was RET_SUBMIT and the
    /// importer copes with the lost unlink.
    pub fn unlink(&self, cmd: CmdUnlink) {
        let recorded = {
            let mut tables = self.tables.lock().expect("urb tables poisoned");
            if tables.in_flight.contains_key(&cmd.target_seqnum) {
                tables.pending_unlinks.insert(cmd.target_seqnum, cmd.seqnum);
                true
            } else {
                false
            }
        };
        if !recorded {
            debug!(target = cmd.target_seqnum, "unlink target not in flight, dropping");
            return;
        }
        if self.device_gone.load(Ordering::Acquire) {
            // Nothing to cancel; the completion with NO_DEVICE resolves it.
            return;
        }
        debug!(target = cmd.target_seqnum, unlink = cmd.seqnum, "cancelling in-flight transfers");
        self.cancel_all_endpoints();
    }

    /// Completion callback. Runs on a controller-owned context; must not
    /// block on the socket, only enqueue.
    fn on_complete(self: &Arc<Self>, seqnum: u32, mut transfer: Transfer) {
        if self.shutting_down.load(Ordering::Acquire) {
            let mut tables = self.tables.lock().expect("urb tables poisoned");
            tables.in_flight.remove(&seqnum);
            return;
        }

        let (context, unlink) = {
            let mut tables = self.tables.lock().expect("urb tables poisoned");
            (tables.in_flight.remove(&seqnum), tables.pending_unlinks.remove(&seqnum))
        };
        let Some(context) = context else {
            trace!(seqnum, "completion for reaped urb, dropping");
            return;
        };

        if transfer.status == TransferStatus::NoDevice {
            info!("device removed mid-transfer");
            self.device_gone.store(true, Ordering::Release);
        }

        if let Some(unlink_seqnum) = unlink {
            let code = transfer.status.to_urb_status().code();
            info!(seqnum, unlink_seqnum, code, "urb unlinked");
            self.enqueue_blocking(RetUnlink::new(unlink_seqnum, code).to_bytes());
        } else if transfer.status == TransferStatus::Canceled {
            // Cascade: an endpoint-level cancel for some other URB's
            // unlink swept this transfer along. Resubmit it unchanged.
            trace!(seqnum, "resubmitting cascade-cancelled urb");
            transfer.status = TransferStatus::Completed;
            transfer.actual_num_bytes = 0;
            self.insert_context(seqnum, context);
            let result = {
                let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
                if context.kind == EndpointKind::Control {
                    self.device.controller.submit_control(transfer, self.completion(seqnum))
                } else {
                    self.device.controller.submit(transfer, self.completion(seqnum))
                }
            };
            match result {
                Ok(()) => return, // back in flight, keep the bulk slot
                Err(e) => {
                    warn!(seqnum, "cascade resubmit failed: {e}");
                    self.remove_context(seqnum);
                    self.enqueue_blocking(RetSubmit::epipe(seqnum).to_bytes());
                }
            }
        } else {
            let reply = self.build_ret_submit(seqnum, &context, &transfer);
            self.enqueue_blocking(reply.to_bytes());
        }

        if context.counts_as_bulk {
            self.release_bulk_slot();
        }
        // Dropping the transfer returns its buffer to the controller layer.
    }

    fn build_ret_submit(&self, seqnum: u32, context: &UrbContext, transfer: &Transfer) -> RetSubmit {
        let status = transfer.status.to_urb_status();

        let data = if context.direction.is_in() {
            let offset =
                if context.kind == EndpointKind::Control { SetupPacket::SIZE } else { 0 };
            if transfer.actual_num_bytes > offset {
                let available = transfer.actual_num_bytes - offset;
                let len = available.min(context.requested_len as usize);
                transfer.data[offset..offset + len].to_vec()
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        if context.kind == EndpointKind::Isochronous {
            let descriptors: Vec<IsoPacketDescriptor> = transfer
                .iso_packets
                .iter()
                .map(|p| IsoPacketDescriptor {
                    offset: p.offset,
                    length: p.num_bytes,
                    actual_length: p.actual_num_bytes,
                    status: p.status.to_urb_status().code(),
                })
                .collect();
            RetSubmit::with_iso(seqnum, status.code(), data, descriptors)
        } else {
            RetSubmit::with_status(seqnum, status.code(), data)
        }
    }

    /// Run a control transfer to completion, for the tweak paths that need
    /// a synchronous result.
    pub(crate) async fn sync_control(&self, setup: &SetupPacket) -> Result<TransferStatus, ()> {
        let capacity = SetupPacket::SIZE + setup.length as usize;
        let mut transfer = self.device.controller.alloc_transfer(capacity, 0).map_err(|e| {
            warn!("sync control allocation failed: {e}");
        })?;
        write_setup(&mut transfer, setup);
        transfer.num_bytes = capacity;
        transfer.endpoint = if setup.is_in() { 0x80 } else { 0x00 };

        let (tx, rx) = oneshot::channel();
        let result = {
            let _gate = self.cancel_gate.read().expect("cancel gate poisoned");
            self.device.controller.submit_control(
                transfer,
                Box::new(move |t| {
                    let _ = tx.send(t);
                }),
            )
        };
        result.map_err(|e| {
            warn!("sync control submit failed: {e}");
        })?;
        rx.await.map(|t| t.status).map_err(|_| ())
    }

    /// Best-effort endpoint-level cancel of everything in flight.
    pub(crate) fn cancel_all_endpoints(&self) {
        let _gate = self.cancel_gate.write().expect("cancel gate poisoned");
        for endpoint in &self.endpoints {
            if endpoint.kind == EndpointKind::Control {
                continue;
            }
            if let Err(e) = self.device.controller.endpoint_clear(endpoint.address) {
                warn!(
                    endpoint = format_args!("{:#04x}", endpoint.address),
                    "endpoint clear failed: {e}"
                );
            }
        }
    }

    /// Coarse free-memory probe before bulk submits. Below the low-water
    /// mark every in-flight transfer is force-cancelled and the tables
    /// reset so the next submit can proceed.
    fn check_memory_pressure(&self) {
        let Some(free) = self.device.controller.free_memory() else { return };
        {
            let mut last = self.last_memory_check.lock().expect("memory check lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < MEMORY_CHECK_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        debug!(free, in_flight = self.in_flight_count(), "memory probe");
        if free < LOW_MEMORY_WATERMARK {
            warn!(free, "memory low, force-cancelling in-flight transfers");
            self.cancel_all_endpoints();
            let mut tables = self.tables.lock().expect("urb tables poisoned");
            tables.in_flight.clear();
            drop(tables);
            self.bulk_in_flight.store(0, Ordering::Release);
        }
    }

    /// Session teardown: cancel everything and wait for the in-flight
    /// table to drain before the socket is released.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if !self.device_gone.load(Ordering::Acquire) {
            self.cancel_all_endpoints();
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = self.in_flight_count();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "in-flight transfers did not drain, dropping contexts");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let mut tables = self.tables.lock().expect("urb tables poisoned");
        tables.in_flight.clear();
        tables.pending_unlinks.clear();
        drop(tables);
        self.bulk_in_flight.store(0, Ordering::Release);
    }

    pub fn in_flight_count(&self) -> usize {
        self.tables.lock().expect("urb tables poisoned").in_flight.len()
    }

    fn endpoint_info(&self, address: u8) -> Option<EndpointInfo> {
        self.endpoints.iter().find(|e| e.address == address).copied()
    }

    fn completion(self: &Arc<Self>, seqnum: u32) -> crate::usb::Completion {
        let dispatcher = Arc::clone(self);
        Box::new(move |transfer| dispatcher.on_complete(seqnum, transfer))
    }

    fn insert_context(&self, seqnum: u32, context: UrbContext) {
        let mut tables = self.tables.lock().expect("urb tables poisoned");
        if tables.in_flight.insert(seqnum, context).is_some() {
            warn!(seqnum, "importer reused an in-flight seqnum");
        }
    }

    fn remove_context(&self, seqnum: u32) {
        let mut tables = self.tables.lock().expect("urb tables poisoned");
        tables.in_flight.remove(&seqnum);
    }

    fn release_bulk_slot(&self) {
        let mut current = self.bulk_in_flight.load(Ordering::Acquire);
        while current > 0 {
            match self.bulk_in_flight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) async fn enqueue(&self, frame: Vec<u8>) {
        if self.replies.send(frame).await.is_err() {
            debug!("reply queue closed, dropping frame");
        }
    }

    pub(crate) fn enqueue_blocking(&self, frame: Vec<u8>) {
        if self.replies.send_blocking(frame).is_err() {
            debug!("reply queue closed, dropping frame");
        }
    }

    #[cfg(test)]
    pub(crate) fn force_memory_check_due(&self) {
        *self.last_memory_check.lock().unwrap() = None;
    }
}

fn endpoint_address(ep: u32, direction: Direction) -> u8 {
    (ep as u8 & 0x0f) | if direction.is_in() { 0x80 } else { 0 }
}

fn round_to_packet(len: u32, max_packet_size: u16) -> u32 {
    let max_packet = max_packet_size as u32;
    if max_packet == 0 || len % max_packet == 0 {
        return len;
    }
    len.div_ceil(max_packet) * max_packet
}

fn translate_flags(transfer_flags: u32) -> TransferFlags {
    // Only URB_ZERO_PACKET maps to the controller; everything else the
    // importer sets is a kernel-side concern.
    TransferFlags { zero_packet: transfer_flags & URB_ZERO_PACKET != 0 }
}
