//! USB/IP wire codec
//!
//! Frame readers and writers for both protocol phases, based on the
//! [Linux kernel documentation](https://docs.kernel.org/usb/usbip_protocol.html).
//!
//! Op-phase messages carry an 8-byte header (version, code, status);
//! URB-phase messages carry a 48-byte header whose first 20 bytes are
//! command, seqnum, devid, direction and endpoint. All integers are
//! big-endian. Replies are built as complete byte vectors so the session's
//! writer can put each frame on the socket in a single write.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;
use crate::types::{BusId, DeviceRecord, Direction, InterfaceRecord, IsoPacketDescriptor};

/// The protocol version spoken and required: 1.1.1.
pub const USBIP_VERSION: u16 = 0x0111;

/// Op-phase code: retrieve the list of exported devices.
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Op-phase code: reply with the list of exported devices.
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Op-phase code: import (attach to) one exported device.
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Op-phase code: reply to an import request.
pub const OP_REP_IMPORT: u16 = 0x0003;

/// URB-phase command: submit an URB.
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// URB-phase command: unlink a previously submitted URB.
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// URB-phase reply: completion of a submitted URB.
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
/// URB-phase reply: completion of an unlink.
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Op-reply status for "no such device".
pub const OP_STATUS_ERROR: u32 = 1;

/// Upper bound on a single URB's buffer length. A well-behaved importer
/// stays far below this; anything larger is treated as a decode error
/// rather than an allocation request.
pub const MAX_TRANSFER_BUFFER: u32 = 16 * 1024 * 1024;

/// Upper bound on the isochronous packet count of one URB.
pub const MAX_ISO_PACKETS: u32 = 4096;

/// A decoded op-phase request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    Devlist,
    Import { busid: BusId },
}

/// Read one op-phase request frame.
///
/// Any unknown code or version mismatch is fatal to the session.
pub async fn read_op_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<OpRequest, ProtocolError> {
    let version = r.read_u16().await?;
    if version != USBIP_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let code = r.read_u16().await?;
    let _status = r.read_u32().await?;

    match code {
        OP_REQ_DEVLIST => Ok(OpRequest::Devlist),
        OP_REQ_IMPORT => {
            let mut busid = [0u8; BusId::WIRE_SIZE];
            r.read_exact(&mut busid).await?;
            Ok(OpRequest::Import { busid: BusId::from_wire(busid) })
        }
        other => Err(ProtocolError::UnknownOpCode(other)),
    }
}

/// Build the OP_REP_DEVLIST frame for the given registry snapshot.
pub fn op_rep_devlist(devices: &[DeviceRecord]) -> Vec<u8> {
    let body: usize = devices
        .iter()
        .map(|d| DeviceRecord::WIRE_SIZE + d.interfaces.len() * InterfaceRecord::WIRE_SIZE)
        .sum();
    let mut out = Vec::with_capacity(12 + body);
    out.extend_from_slice(&USBIP_VERSION.to_be_bytes());
    out.extend_from_slice(&OP_REP_DEVLIST.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for device in devices {
        device.write_with_interfaces(&mut out).expect("write to Vec cannot fail");
    }
    out
}

/// Build a successful OP_REP_IMPORT frame carrying the device record.
pub fn op_rep_import_ok(device: &DeviceRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + DeviceRecord::WIRE_SIZE);
    out.extend_from_slice(&USBIP_VERSION.to_be_bytes());
    out.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    device.write_to(&mut out).expect("write to Vec cannot fail");
    out
}

/// Build a failed OP_REP_IMPORT frame (status only, no record).
pub fn op_rep_import_fail() -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&USBIP_VERSION.to_be_bytes());
    out.extend_from_slice(&OP_REP_IMPORT.to_be_bytes());
    out.extend_from_slice(&OP_STATUS_ERROR.to_be_bytes());
    out
}

/// A decoded CMD_SUBMIT, including the OUT payload and iso descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
    pub data: Vec<u8>,
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

/// A decoded CMD_UNLINK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    /// The unlink's own sequence number, echoed in RET_UNLINK.
    pub seqnum: u32,
    pub devid: u32,
    /// Sequence number of the URB being cancelled.
    pub target_seqnum: u32,
}

/// One URB-phase command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbCommand {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

/// Read one URB-phase command frame.
///
/// The OUT payload is consumed only when the direction says there is one;
/// iso descriptors are consumed when `number_of_packets` names any. The
/// kernel documents 0xFFFFFFFF for "no packets" while the implementation
/// sends 0, so both are accepted.
pub async fn read_urb_command<R: AsyncRead + Unpin>(r: &mut R) -> Result<UrbCommand, ProtocolError> {
    let command = r.read_u32().await?;
    let seqnum = r.read_u32().await?;
    let devid = r.read_u32().await?;
    let direction = r.read_u32().await?;
    let ep = r.read_u32().await?;

    match command {
        USBIP_CMD_SUBMIT => {
            let direction = Direction::from_wire(direction)?;
            let transfer_flags = r.read_u32().await?;
            let transfer_buffer_length = r.read_u32().await?;
            if transfer_buffer_length > MAX_TRANSFER_BUFFER {
                return Err(ProtocolError::OversizedTransfer(transfer_buffer_length));
            }
            let start_frame = r.read_u32().await?;
            let number_of_packets = r.read_u32().await?;
            let interval = r.read_u32().await?;
            let mut setup = [0u8; 8];
            r.read_exact(&mut setup).await?;

            let data = if direction == Direction::Out && transfer_buffer_length > 0 {
                let mut data = vec![0u8; transfer_buffer_length as usize];
                r.read_exact(&mut data).await?;
                data
            } else {
                Vec::new()
            };

            let iso_descriptors = if number_of_packets != 0 && number_of_packets != 0xFFFF_FFFF {
                if number_of_packets > MAX_ISO_PACKETS {
                    return Err(ProtocolError::TooManyIsoPackets(number_of_packets));
                }
                let mut raw = vec![0u8; number_of_packets as usize * IsoPacketDescriptor::WIRE_SIZE];
                r.read_exact(&mut raw).await?;
                IsoPacketDescriptor::decode_vec(&raw, number_of_packets as usize)?
            } else {
                Vec::new()
            };

            Ok(UrbCommand::Submit(CmdSubmit {
                seqnum,
                devid,
                direction,
                ep,
                transfer_flags,
                transfer_buffer_length,
                start_frame,
                number_of_packets,
                interval,
                setup,
                data,
                iso_descriptors,
            }))
        }
        USBIP_CMD_UNLINK => {
            let target_seqnum = r.read_u32().await?;
            let mut padding = [0u8; 24];
            r.read_exact(&mut padding).await?;
            Ok(UrbCommand::Unlink(CmdUnlink { seqnum, devid, target_seqnum }))
        }
        other => Err(ProtocolError::UnknownUrbCommand(other)),
    }
}

/// A RET_SUBMIT reply ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    pub data: Vec<u8>,
    pub iso_descriptors: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    /// A successful completion carrying `data` as the payload.
    pub fn with_data(seqnum: u32, data: Vec<u8>) -> Self {
        Self {
            seqnum,
            status: 0,
            actual_length: data.len() as u32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
            iso_descriptors: Vec::new(),
        }
    }

    /// A completion with an explicit status and whatever payload was
    /// gathered before the transfer ended.
    pub fn with_status(seqnum: u32, status: i32, data: Vec<u8>) -> Self {
        Self {
            seqnum,
            status,
            actual_length: data.len() as u32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
            iso_descriptors: Vec::new(),
        }
    }

    /// An isochronous completion with per-packet descriptors.
    pub fn with_iso(seqnum: u32, status: i32, data: Vec<u8>, iso: Vec<IsoPacketDescriptor>) -> Self {
        let error_count = iso.iter().filter(|d| d.status != 0).count() as u32;
        Self {
            seqnum,
            status,
            actual_length: data.len() as u32,
            start_frame: 0,
            number_of_packets: iso.len() as u32,
            error_count,
            data,
            iso_descriptors: iso,
        }
    }

    /// The backpressure / submit-failure reply: EPIPE, no payload.
    pub fn epipe(seqnum: u32) -> Self {
        Self::with_status(seqnum, crate::types::UrbStatus::Epipe.code(), Vec::new())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(48 + self.data.len() + self.iso_descriptors.len() * IsoPacketDescriptor::WIRE_SIZE);
        out.extend_from_slice(&USBIP_RET_SUBMIT.to_be_bytes());
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // devid
        out.extend_from_slice(&0u32.to_be_bytes()); // direction
        out.extend_from_slice(&0u32.to_be_bytes()); // ep
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&self.actual_length.to_be_bytes());
        out.extend_from_slice(&self.start_frame.to_be_bytes());
        out.extend_from_slice(&self.number_of_packets.to_be_bytes());
        out.extend_from_slice(&self.error_count.to_be_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.data);
        for descriptor in &self.iso_descriptors {
            descriptor.write_to(&mut out).expect("write to Vec cannot fail");
        }
        out
    }
}

/// A RET_UNLINK reply ready for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    /// Sequence number of the CMD_UNLINK being answered (not the target's).
    pub seqnum: u32,
    pub status: i32,
}

impl RetUnlink {
    pub fn new(seqnum: u32, status: i32) -> Self {
        Self { seqnum, status }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(&USBIP_RET_UNLINK.to_be_bytes());
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // devid
        out.extend_from_slice(&0u32.to_be_bytes()); // direction
        out.extend_from_slice(&0u32.to_be_bytes()); // ep
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]);
        out
    }
}
