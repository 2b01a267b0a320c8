//! IPC message envelopes
//!
//! Fixed-size envelopes: a header plus up to 128 bytes of payload.
//! Larger transfers go through shared-memory regions. Payloads that do
//! not fit are truncated by the kernel, not rejected.

use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum payload carried inline in a message
pub const MAX_PAYLOAD: usize = 128;

/// Message id allocator
static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Envelope header
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Globally unique message id
    pub msg_id: u64,
    /// Sender task id (0 for kernel senders)
    pub sender: u64,
    /// Port the receiver should reply to (0 = none)
    pub reply_port: u32,
    /// Payload bytes actually carried
    pub size: u32,
    /// Monotonic tick at send time
    pub timestamp: u64,
}

/// A complete message envelope
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: [u8; MAX_PAYLOAD],
}

impl Message {
    /// Build an envelope, truncating oversized payloads.
    pub fn new(sender: u64, reply_port: u32, data: &[u8], timestamp: u64) -> Self {
        let size = data.len().min(MAX_PAYLOAD);
        let mut payload = [0u8; MAX_PAYLOAD];
        payload[..size].copy_from_slice(&data[..size]);
        Self {
            header: MessageHeader {
                msg_id: NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed),
                sender,
                reply_port,
                size: size as u32,
                timestamp,
            },
            payload,
        }
    }

    /// The carried payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.header.size as usize]
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn payload_is_carried_and_ids_are_unique() {
        let a = Message::new(7, 3, b"ping", 100);
        let b = Message::new(7, 0, b"pong", 101);
        assert_eq!(a.data(), b"ping");
        assert_eq!(a.header.sender, 7);
        assert_eq!(a.header.reply_port, 3);
        assert_ne!(a.header.msg_id, b.header.msg_id);
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let big = [0xEE; MAX_PAYLOAD + 64];
        let msg = Message::new(1, 0, &big, 0);
        assert_eq!(msg.header.size as usize, MAX_PAYLOAD);
        assert_eq!(msg.data().len(), MAX_PAYLOAD);
    }
}
