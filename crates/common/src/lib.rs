//! Common utilities for the USB/IP export server
//!
//! Shared error type and logging setup used by the protocol and server
//! crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
