//! Scriptable host controller for tests
//!
//! Two modes of operation. With scripted replies, a submit completes
//! inline with the next canned reply for its endpoint, which is enough to
//! drive whole sessions over an in-memory socket. Without a script the
//! transfer parks in a pending queue and the test fires completions one
//! by one, which gives deterministic interleavings for the cancellation
//! races.
//!
//! Completion callbacks are always invoked with no internal lock held, so
//! a callback may re-enter `submit` (the cascade resubmit path does).

use protocol::SetupPacket;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::host::{
    Completion, EndpointInfo, HostController, HostError, IsoPacket, Transfer, TransferFlags,
    TransferStatus,
};

/// One canned completion for a given endpoint.
pub struct MockReply {
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

impl MockReply {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { status: TransferStatus::Completed, data }
    }

    pub fn status(status: TransferStatus) -> Self {
        Self { status, data: Vec::new() }
    }
}

struct Pending {
    transfer: Transfer,
    complete: Completion,
}

#[derive(Default)]
struct MockState {
    scripts: Vec<(u8, VecDeque<MockReply>)>,
    pending: VecDeque<Pending>,
    canceled: VecDeque<Pending>,
    cleared: Vec<u8>,
    alloc_failures: usize,
    submit_failures: usize,
    clear_failures: usize,
    free_memory: Option<usize>,
    submitted: usize,
    submitted_sizes: Vec<(u8, usize)>,
}

/// Test double for the host-controller adapter.
pub struct MockController {
    endpoints: Vec<EndpointInfo>,
    state: Mutex<MockState>,
}

impl MockController {
    pub fn new(endpoints: Vec<EndpointInfo>) -> Self {
        Self { endpoints, state: Mutex::new(MockState::default()) }
    }

    /// Queue a canned completion for submissions on `endpoint`.
    pub fn script(&self, endpoint: u8, reply: MockReply) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, queue)) = state.scripts.iter_mut().find(|(ep, _)| *ep == endpoint) {
            queue.push_back(reply);
        } else {
            state.scripts.push((endpoint, VecDeque::from([reply])));
        }
    }

    /// Fail the next `n` transfer allocations.
    pub fn fail_allocs(&self, n: usize) {
        self.state.lock().unwrap().alloc_failures = n;
    }

    /// Fail the next `n` submits.
    pub fn fail_submits(&self, n: usize) {
        self.state.lock().unwrap().submit_failures = n;
    }

    /// Fail the next `n` endpoint clears.
    pub fn fail_clears(&self, n: usize) {
        self.state.lock().unwrap().clear_failures = n;
    }

    pub fn set_free_memory(&self, bytes: Option<usize>) {
        self.state.lock().unwrap().free_memory = bytes;
    }

    /// Endpoints passed to `endpoint_clear` so far.
    pub fn cleared(&self) -> Vec<u8> {
        self.state.lock().unwrap().cleared.clone()
    }

    /// Transfers submitted and still waiting for a manual completion.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Total number of accepted submits.
    pub fn submitted_count(&self) -> usize {
        self.state.lock().unwrap().submitted
    }

    /// `(endpoint, num_bytes)` of every accepted submit, in order.
    pub fn submitted_sizes(&self) -> Vec<(u8, usize)> {
        self.state.lock().unwrap().submitted_sizes.clone()
    }

    /// Complete the oldest pending transfer with `status`; for IN
    /// transfers `data` is copied into the buffer.
    pub fn fire_next(&self, status: TransferStatus, data: &[u8]) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.pending.pop_front().expect("no pending transfer to fire")
        };
        Self::finish(pending, status, data);
    }

    /// Fire completions for every transfer cancelled by `endpoint_clear`,
    /// in cancellation order.
    pub fn flush_canceled(&self) {
        loop {
            let next = { self.state.lock().unwrap().canceled.pop_front() };
            match next {
                Some(pending) => Self::finish(pending, TransferStatus::Canceled, &[]),
                None => break,
            }
        }
    }

    fn finish(pending: Pending, status: TransferStatus, data: &[u8]) {
        let Pending { mut transfer, complete } = pending;
        let offset = if transfer.endpoint & 0x7f == 0 { SetupPacket::SIZE } else { 0 };
        transfer.status = status;
        if transfer.endpoint & 0x80 != 0 || offset > 0 {
            let room = transfer.data.len().saturating_sub(offset);
            let n = data.len().min(room);
            transfer.data[offset..offset + n].copy_from_slice(&data[..n]);
            transfer.actual_num_bytes = offset + n;
        } else {
            transfer.actual_num_bytes = transfer.num_bytes;
        }
        if status == TransferStatus::Completed {
            for packet in &mut transfer.iso_packets {
                packet.actual_num_bytes = packet.num_bytes;
                packet.status = TransferStatus::Completed;
            }
        }
        complete(transfer);
    }

    fn submit_inner(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError> {
        let scripted = {
            let mut state = self.state.lock().unwrap();
            if state.submit_failures > 0 {
                state.submit_failures -= 1;
                return Err(HostError::SubmitFailed(transfer.endpoint));
            }
            state.submitted += 1;
            state.submitted_sizes.push((transfer.endpoint, transfer.num_bytes));
            let scripted = state
                .scripts
                .iter_mut()
                .find(|(ep, _)| *ep == transfer.endpoint)
                .and_then(|(_, queue)| queue.pop_front());
            if scripted.is_none() {
                state.pending.push_back(Pending { transfer, complete });
                return Ok(());
            }
            scripted
        };
        // Lock released: scripted completions run inline.
        let reply = scripted.expect("checked above");
        Self::finish(Pending { transfer, complete }, reply.status, &reply.data);
        Ok(())
    }
}

impl HostController for MockController {
    fn alloc_transfer(&self, data_capacity: usize, iso_count: usize) -> Result<Transfer, HostError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.alloc_failures > 0 {
                state.alloc_failures -= 1;
                return Err(HostError::OutOfMemory(data_capacity));
            }
        }
        Ok(Transfer {
            data: vec![0u8; data_capacity],
            num_bytes: 0,
            actual_num_bytes: 0,
            status: TransferStatus::Completed,
            endpoint: 0,
            flags: TransferFlags::default(),
            iso_packets: vec![
                IsoPacket {
                    offset: 0,
                    num_bytes: 0,
                    actual_num_bytes: 0,
                    status: TransferStatus::Completed
                };
                iso_count
            ],
        })
    }

    fn submit_control(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError> {
        self.submit_inner(transfer, complete)
    }

    fn submit(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError> {
        self.submit_inner(transfer, complete)
    }

    fn endpoint_clear(&self, endpoint: u8) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.clear_failures > 0 {
            state.clear_failures -= 1;
            return Err(HostError::Backend("scripted clear failure".to_string()));
        }
        state.cleared.push(endpoint);
        // Endpoint-level cancel sweeps every pending transfer on the
        // endpoint, not just the one the caller cares about.
        let mut keep = VecDeque::new();
        while let Some(pending) = state.pending.pop_front() {
            if pending.transfer.endpoint == endpoint {
                state.canceled.push_back(pending);
            } else {
                keep.push_back(pending);
            }
        }
        state.pending = keep;
        Ok(())
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.clone()
    }

    fn free_memory(&self) -> Option<usize> {
        self.state.lock().unwrap().free_memory
    }
}
