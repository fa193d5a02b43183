//! Byte buffers shared between a socket task and the scheduler.
//!
//! The socket side calls [`PeerHandle::receive`] and [`PeerHandle::transmit`];
//! the session side drains inbound bytes and appends outbound ones. Each
//! direction has its own lock, so reads and writes never contend.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Transport endpoint for one connection.
#[derive(Debug)]
pub struct PeerHandle {
    inbound: Mutex<BytesMut>,
    outbound: Mutex<BytesMut>,
    last_received: Mutex<Option<Instant>>,
    disconnect: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl PeerHandle {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(BytesMut::new()),
            outbound: Mutex::new(BytesMut::new()),
            last_received: Mutex::new(None),
            disconnect: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Appends bytes read from the socket.
    pub fn receive(&self, data: &[u8]) {
        self.receive_at(data, Instant::now());
    }

    pub fn receive_at(&self, data: &[u8], at: Instant) {
        if data.is_empty() {
            return;
        }
        self.inbound.lock().extend_from_slice(data);
        *self.last_received.lock() = Some(at);
        self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    /// Drains everything queued for the socket.
    pub fn transmit(&self) -> Bytes {
        self.outbound.lock().split().freeze()
    }

    /// Requests that the connection be closed once pending output is written.
    pub fn disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    /// Takes the bytes received since the last call.
    pub fn take_inbound(&self) -> BytesMut {
        self.inbound.lock().split()
    }

    /// Queues bytes for the socket.
    pub fn send(&self, data: &[u8]) {
        self.outbound.lock().extend_from_slice(data);
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    /// When bytes last arrived, if ever.
    pub fn last_received(&self) -> Option<Instant> {
        *self.last_received.lock()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl Default for PeerHandle {
    fn default() -> Self {
        Self::new()
    }
}
