//! USB subsystem: the host-controller adapter contract, its rusb backend,
//! device enumeration and the process-wide device registry.

pub mod enumerate;
pub mod host;
pub mod libusb;
pub mod registry;

#[cfg(test)]
pub mod mock;

pub use host::{
    Completion, EndpointInfo, EndpointKind, HostController, HostError, Transfer, TransferStatus,
};
pub use registry::{AttachedDevice, Registry, RegistryError};
