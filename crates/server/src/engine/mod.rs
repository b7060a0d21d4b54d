//! The USB/IP protocol engine: URB dispatch and special-request tweaks.

pub mod dispatcher;
mod tweaks;

pub use dispatcher::{
    CHUNK_SIZE, CHUNK_THRESHOLD, LOW_MEMORY_WATERMARK, MAX_CONCURRENT_BULK, MAX_TRANSFER_SIZE,
    MEMORY_CHECK_INTERVAL, UrbDispatcher,
};
