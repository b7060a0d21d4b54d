//! Shared protocol-level types
//!
//! Device and interface records as they appear in OP_REP_DEVLIST /
//! OP_REP_IMPORT, plus the small fixed-layout pieces (bus ids, setup
//! packets, isochronous packet descriptors) used by both protocol phases.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

use crate::error::ProtocolError;

/// Transfer direction as encoded in the URB command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Out => 0,
            Self::In => 1,
        }
    }

    pub fn is_in(self) -> bool {
        self == Self::In
    }
}

/// URB completion status codes carried in RET_SUBMIT / RET_UNLINK.
///
/// These mirror the Linux kernel errno values the vhci driver expects;
/// the wire representation is a signed big-endian 32-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum UrbStatus {
    Ok = 0,
    Enoent = -2,
    Econnreset = -104,
    Etimedout = -110,
    Epipe = -32,
    Eshutdown = -108,
    Eoverflow = -75,
}

impl UrbStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The only importer transfer flag the engine honours: request a trailing
/// zero-length packet on OUT transfers that end on a packet boundary.
pub const URB_ZERO_PACKET: u32 = 0x4000_0000;

/// Device speed codes used in the device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
}

impl DeviceSpeed {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Fixed 32-byte NUL-padded bus identifier, e.g. `"1-1"`.
///
/// Unique among exportable devices for the lifetime of the server; used
/// verbatim as the OP_REQ_IMPORT lookup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId([u8; Self::WIRE_SIZE]);

impl BusId {
    pub const WIRE_SIZE: usize = 32;

    /// Build a bus id from a textual identifier.
    ///
    /// The string must leave room for at least one trailing NUL.
    pub fn new(s: &str) -> Result<Self, ProtocolError> {
        if s.len() >= Self::WIRE_SIZE {
            return Err(ProtocolError::BusIdTooLong(s.len()));
        }
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }

    pub fn from_wire(bytes: [u8; Self::WIRE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::WIRE_SIZE] {
        &self.0
    }

    fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(Self::WIRE_SIZE);
        &self.0[..end]
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusId({})", self)
    }
}

/// One interface of an exported device: the (class, subclass, protocol)
/// triplet published in OP_REP_DEVLIST. Immutable once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceRecord {
    /// Wire size of one interface entry (triplet plus one reserved byte).
    pub const WIRE_SIZE: usize = 4;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.class)?;
        w.write_u8(self.subclass)?;
        w.write_u8(self.protocol)?;
        w.write_u8(0)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let class = r.read_u8()?;
        let subclass = r.read_u8()?;
        let protocol = r.read_u8()?;
        let _reserved = r.read_u8()?;
        Ok(Self { class, subclass, protocol })
    }
}

/// Cached descriptor fields of one exportable device.
///
/// Serialized as the fixed 312-byte record of OP_REP_DEVLIST and
/// OP_REP_IMPORT; the interface list is appended only in the devlist
/// reply, 4 bytes per interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub busid: BusId,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceRecord>,
}

impl DeviceRecord {
    /// Wire size of the record without the interface list.
    pub const WIRE_SIZE: usize = 312;

    const PATH_SIZE: usize = 256;

    /// Device id as carried in the URB command header: `bus << 16 | dev`.
    pub fn devid(&self) -> u32 {
        self.busnum << 16 | self.devnum
    }

    /// Write the 312-byte record.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let mut path = [0u8; Self::PATH_SIZE];
        let len = self.path.len().min(Self::PATH_SIZE - 1);
        path[..len].copy_from_slice(&self.path.as_bytes()[..len]);
        w.write_all(&path)?;
        w.write_all(self.busid.as_bytes())?;
        w.write_u32::<BigEndian>(self.busnum)?;
        w.write_u32::<BigEndian>(self.devnum)?;
        w.write_u32::<BigEndian>(self.speed.code())?;
        w.write_u16::<BigEndian>(self.id_vendor)?;
        w.write_u16::<BigEndian>(self.id_product)?;
        w.write_u16::<BigEndian>(self.bcd_device)?;
        w.write_u8(self.device_class)?;
        w.write_u8(self.device_subclass)?;
        w.write_u8(self.device_protocol)?;
        w.write_u8(self.configuration_value)?;
        w.write_u8(self.num_configurations)?;
        w.write_u8(self.interfaces.len() as u8)
    }

    /// Write the record followed by its per-interface entries.
    pub fn write_with_interfaces<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.write_to(w)?;
        for iface in &self.interfaces {
            iface.write_to(w)?;
        }
        Ok(())
    }

    /// Read the 312-byte record. The interface list is left empty; callers
    /// that expect interface entries read them separately using the
    /// `bNumInterfaces` count returned alongside.
    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<(Self, u8)> {
        let mut path = [0u8; Self::PATH_SIZE];
        r.read_exact(&mut path)?;
        let end = path.iter().position(|&b| b == 0).unwrap_or(Self::PATH_SIZE);
        let path = String::from_utf8_lossy(&path[..end]).into_owned();

        let mut busid = [0u8; BusId::WIRE_SIZE];
        r.read_exact(&mut busid)?;

        let busnum = r.read_u32::<BigEndian>()?;
        let devnum = r.read_u32::<BigEndian>()?;
        let speed = match r.read_u32::<BigEndian>()? {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Wireless,
            5 => DeviceSpeed::Super,
            _ => DeviceSpeed::Unknown,
        };
        let id_vendor = r.read_u16::<BigEndian>()?;
        let id_product = r.read_u16::<BigEndian>()?;
        let bcd_device = r.read_u16::<BigEndian>()?;
        let device_class = r.read_u8()?;
        let device_subclass = r.read_u8()?;
        let device_protocol = r.read_u8()?;
        let configuration_value = r.read_u8()?;
        let num_configurations = r.read_u8()?;
        let num_interfaces = r.read_u8()?;

        Ok((
            Self {
                path,
                busid: BusId::from_wire(busid),
                busnum,
                devnum,
                speed,
                id_vendor,
                id_product,
                bcd_device,
                device_class,
                device_subclass,
                device_protocol,
                configuration_value,
                num_configurations,
                interfaces: Vec::new(),
            },
            num_interfaces,
        ))
    }
}

/// The 8-byte USB setup packet of a control transfer.
///
/// Multi-byte fields are little-endian on the bus, unlike the rest of the
/// USB/IP protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Request classification from `bmRequestType` bits 5..6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction bit 7: set for device-to-host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn kind(&self) -> RequestKind {
        match self.request_type & 0x60 {
            0x00 => RequestKind::Standard,
            0x20 => RequestKind::Class,
            0x40 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }
}

/// One isochronous packet descriptor as carried after CMD_SUBMIT and
/// RET_SUBMIT payloads. 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub const WIRE_SIZE: usize = 16;

    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.offset)?;
        w.write_u32::<BigEndian>(self.length)?;
        w.write_u32::<BigEndian>(self.actual_length)?;
        w.write_i32::<BigEndian>(self.status)
    }

    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            offset: r.read_u32::<BigEndian>()?,
            length: r.read_u32::<BigEndian>()?,
            actual_length: r.read_u32::<BigEndian>()?,
            status: r.read_i32::<BigEndian>()?,
        })
    }

    /// Decode a contiguous run of descriptors.
    pub fn decode_vec(bytes: &[u8], count: usize) -> std::io::Result<Vec<Self>> {
        let mut cursor = std::io::Cursor::new(bytes);
        (0..count).map(|_| Self::read_from(&mut cursor)).collect()
    }

    /// Encode a run of descriptors back to bytes.
    pub fn encode_vec(descriptors: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(descriptors.len() * Self::WIRE_SIZE);
        for d in descriptors {
            d.write_to(&mut out).expect("write to Vec cannot fail");
        }
        out
    }
}
