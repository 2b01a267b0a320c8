//! Inter-process communication
//!
//! Two primitives bridge the user-space services: named message ports
//! (bounded FIFO queues with blocking endpoints) and anonymous
//! shared-memory regions for bulk data. Ports carry small fixed-size
//! envelopes; anything larger travels by mapping a region into both
//! sides.

pub mod message;
pub mod port;
pub mod registry;
pub mod shmem;

pub use message::{Message, MessageHeader, MAX_PAYLOAD};
pub use port::{IpcFlags, Port, DEFAULT_CAPACITY};
pub use shmem::{ShmTable, SHM_TABLE};

/// Log the subsystem banner; tables are lazily constructed statics.
pub fn init() {
    log::info!("[IPC] ports and shared-memory tables ready");
}
