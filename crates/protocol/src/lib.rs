//! USB/IP wire protocol for the export server
//!
//! This crate defines the binary protocol spoken between a USB/IP importer
//! (typically the Linux `vhci_hcd` driver) and the export server: the
//! op-phase device listing and import handshake, and the URB-phase
//! submit/unlink commands with their replies. All integers on the wire are
//! big-endian; strings are fixed-length and NUL-padded.
//!
//! # Example
//!
//! ```
//! use protocol::{RetSubmit, UrbStatus};
//!
//! // A completed 4-byte IN transfer for seqnum 12.
//! let reply = RetSubmit::with_data(12, vec![1, 2, 3, 4]);
//! assert_eq!(reply.status, UrbStatus::Ok.code());
//! assert_eq!(reply.to_bytes().len(), 48 + 4);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    CmdSubmit, CmdUnlink, MAX_ISO_PACKETS, MAX_TRANSFER_BUFFER, OP_REP_DEVLIST, OP_REP_IMPORT,
    OP_REQ_DEVLIST, OP_REQ_IMPORT, OP_STATUS_ERROR, OpRequest, RetSubmit, RetUnlink, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK, USBIP_VERSION, op_rep_devlist,
    op_rep_import_fail, op_rep_import_ok, read_op_request, read_urb_command, UrbCommand,
};
pub use error::{ProtocolError, Result};
pub use types::{
    BusId, DeviceRecord, DeviceSpeed, Direction, InterfaceRecord, IsoPacketDescriptor, RequestKind,
    SetupPacket, URB_ZERO_PACKET, UrbStatus,
};
