//! Host-controller adapter contract
//!
//! The URB dispatcher drives USB hardware exclusively through the
//! [`HostController`] trait: allocate a transfer, submit it with a
//! completion callback, clear an endpoint, enumerate endpoints. One
//! concrete backend wraps rusb ([`crate::usb::libusb`]); tests substitute
//! a scriptable mock.

use protocol::{SetupPacket, UrbStatus};
use thiserror::Error;

/// Terminal state of a controller transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    Canceled,
    Stall,
    NoDevice,
    TimedOut,
    Overflow,
}

impl TransferStatus {
    /// Translate a controller status into the importer-facing URB status.
    ///
    /// Stall, transport errors and overflow all collapse into EPIPE; the
    /// importer retries or resets the endpoint either way.
    pub fn to_urb_status(self) -> UrbStatus {
        match self {
            Self::Completed => UrbStatus::Ok,
            Self::Canceled => UrbStatus::Econnreset,
            Self::TimedOut => UrbStatus::Etimedout,
            Self::Error | Self::Stall | Self::Overflow => UrbStatus::Epipe,
            Self::NoDevice => UrbStatus::Eshutdown,
        }
    }
}

/// Controller-level transfer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Terminate an OUT transfer that ends on a packet boundary with a
    /// zero-length packet.
    pub zero_packet: bool,
}

/// One isochronous packet slot inside a [`Transfer`].
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket {
    /// Payload offset within the transfer buffer, taken from the URB.
    pub offset: u32,
    pub num_bytes: u32,
    pub actual_num_bytes: u32,
    pub status: TransferStatus,
}

/// A controller transfer and its buffer.
///
/// Ownership moves into the controller on submit and comes back through
/// the completion callback; between those points nothing else may touch
/// the buffer. For control transfers the first [`SetupPacket::SIZE`] bytes
/// of `data` hold the setup packet and `actual_num_bytes` counts that
/// prefix.
pub struct Transfer {
    pub data: Vec<u8>,
    /// Bytes to transfer on submit. For IN transfers this is already
    /// rounded to a max-packet multiple by the dispatcher.
    pub num_bytes: usize,
    /// Bytes actually transferred, set by the controller on completion.
    pub actual_num_bytes: usize,
    pub status: TransferStatus,
    /// Endpoint address including the direction bit.
    pub endpoint: u8,
    pub flags: TransferFlags,
    pub iso_packets: Vec<IsoPacket>,
}

/// Completion callback invoked by the controller, off its own event
/// context, exactly once per successful submit.
pub type Completion = Box<dyn FnOnce(Transfer) + Send + 'static>;

/// Errors surfaced by a host-controller backend.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transfer allocation of {0} bytes failed")]
    OutOfMemory(usize),

    #[error("endpoint {0:#04x} rejected the transfer")]
    SubmitFailed(u8),

    #[error("device is gone")]
    NoDevice,

    #[error("controller backend: {0}")]
    Backend(String),
}

/// Transfer type of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Runtime view of one endpoint of the attached device.
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    /// Address byte; bit 7 set means IN.
    pub address: u8,
    pub max_packet_size: u16,
    pub kind: EndpointKind,
}

/// The capability set the URB dispatcher requires from a host controller,
/// scoped to one attached device.
pub trait HostController: Send + Sync {
    /// Allocate a transfer with a `data_capacity`-byte buffer and
    /// `iso_count` isochronous packet slots.
    fn alloc_transfer(&self, data_capacity: usize, iso_count: usize) -> Result<Transfer, HostError>;

    /// Submit a control transfer through the default pipe. The first
    /// [`SetupPacket::SIZE`] bytes of the buffer carry the setup packet.
    fn submit_control(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError>;

    /// Submit a non-control transfer on a pre-opened endpoint.
    fn submit(&self, transfer: Transfer, complete: Completion) -> Result<(), HostError>;

    /// Clear a halt condition and flush pending I/O on one endpoint.
    /// Cancellation granularity is the endpoint, not the transfer.
    fn endpoint_clear(&self, endpoint: u8) -> Result<(), HostError>;

    /// All non-default endpoints of the attached device.
    fn endpoints(&self) -> Vec<EndpointInfo>;

    /// Free memory of the pool transfers are carved from, if the backend
    /// tracks one. `None` disables memory-pressure handling.
    fn free_memory(&self) -> Option<usize> {
        None
    }
}

/// Fill a transfer buffer's setup prefix.
pub fn write_setup(transfer: &mut Transfer, setup: &SetupPacket) {
    transfer.data[..SetupPacket::SIZE].copy_from_slice(&setup.to_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_translation_follows_errno_mapping() {
        assert_eq!(TransferStatus::Completed.to_urb_status(), UrbStatus::Ok);
        assert_eq!(TransferStatus::Canceled.to_urb_status(), UrbStatus::Econnreset);
        assert_eq!(TransferStatus::TimedOut.to_urb_status(), UrbStatus::Etimedout);
        assert_eq!(TransferStatus::Error.to_urb_status(), UrbStatus::Epipe);
        assert_eq!(TransferStatus::Stall.to_urb_status(), UrbStatus::Epipe);
        assert_eq!(TransferStatus::Overflow.to_urb_status(), UrbStatus::Epipe);
        assert_eq!(TransferStatus::NoDevice.to_urb_status(), UrbStatus::Eshutdown);
    }
}
