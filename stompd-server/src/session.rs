//! Session management.

use crate::error::ServerError;
use crate::transport::PeerHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use stompd_core::{PeerId, TransactionBuffer};
use stompd_protocol::header;
use stompd_protocol::{Frame, HeartBeat, Negotiated, ProtocolError, StreamParser, HEARTBEAT_BYTES};
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, waiting for CONNECT.
    Connected,
    /// CONNECT accepted.
    Authenticated,
    /// Marked for teardown; no further frames are processed.
    Closing,
}

/// Traffic counted since the last [`Session::take_io_stats`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// A client session.
pub struct Session {
    /// Unique session ID, reported in CONNECTED.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    peer: PeerId,
    state: SessionState,
    login: Option<String>,
    handle: Arc<PeerHandle>,
    parser: StreamParser,
    heartbeat: Option<HeartBeat>,
    transactions: TransactionBuffer,
    created_at: Instant,
    io: IoStats,
}

impl Session {
    /// Creates a new session.
    pub fn new(peer: PeerId, remote_addr: SocketAddr, handle: Arc<PeerHandle>, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            peer,
            state: SessionState::Connected,
            login: None,
            handle,
            parser: StreamParser::new(),
            heartbeat: None,
            transactions: TransactionBuffer::new(),
            created_at: now,
            io: IoStats::default(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Records a successful CONNECT.
    pub fn authenticate(&mut self, login: &str) {
        self.login = Some(login.to_string());
        if self.state == SessionState::Connected {
            self.state = SessionState::Authenticated;
        }
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    pub fn handle(&self) -> &Arc<PeerHandle> {
        &self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn transactions(&self) -> &TransactionBuffer {
        &self.transactions
    }

    pub fn transactions_mut(&mut self) -> &mut TransactionBuffer {
        &mut self.transactions
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Returns the next decoded frame, pulling new bytes from the transport.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProtocolError>> {
        let inbound = self.handle.take_inbound();
        if !inbound.is_empty() {
            self.io.bytes_in += inbound.len() as u64;
            self.parser.extend(&inbound);
        }
        if let (Some(heartbeat), Some(at)) = (self.heartbeat.as_mut(), self.handle.last_received()) {
            heartbeat.record_received(at);
        }

        let next = self.parser.next_frame();
        if matches!(next, Some(Ok(_))) {
            self.io.frames_in += 1;
        }
        next
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Encodes a frame onto the transport.
    pub fn send_frame(&mut self, frame: &Frame, now: Instant) {
        let encoded = frame.encode();
        self.handle.send(&encoded);
        self.io.frames_out += 1;
        self.io.bytes_out += encoded.len() as u64;
        if let Some(heartbeat) = self.heartbeat.as_mut() {
            heartbeat.record_sent(now);
        }
    }

    /// Reports an error to the peer. Fatal errors also close the session.
    pub fn send_error(&mut self, error: &ServerError, now: Instant) {
        let frame = Frame::error(&error.summary(), &error.to_string())
            .with_header(header::CODE, error.error_code().to_string());
        self.send_frame(&frame, now);

        if error.is_fatal() {
            tracing::warn!(
                session_id = %self.id,
                peer = %self.peer,
                error = %error,
                "Closing session after fatal error"
            );
            self.request_disconnect();
        } else {
            tracing::debug!(session_id = %self.id, error = %error, "Sent error frame");
        }
    }

    /// Marks the session for teardown and tells the transport to close.
    pub fn request_disconnect(&mut self) {
        self.state = SessionState::Closing;
        self.handle.disconnect();
    }

    pub fn wants_disconnect(&self) -> bool {
        self.state == SessionState::Closing || self.handle.is_disconnect_requested()
    }

    // =========================================================================
    // Heart-beats
    // =========================================================================

    pub fn enable_heart_beat(&mut self, negotiated: Negotiated, timeout_factor: u32, now: Instant) {
        self.heartbeat = negotiated
            .is_enabled()
            .then(|| HeartBeat::new(negotiated, timeout_factor, now));
    }

    pub fn heart_beat(&self) -> Option<&HeartBeat> {
        self.heartbeat.as_ref()
    }

    /// Writes a heart-beat if the outbound side has been idle long enough.
    pub fn try_heart_beat(&mut self, now: Instant) -> bool {
        let Some(heartbeat) = self.heartbeat.as_mut() else {
            return false;
        };
        if !heartbeat.is_send_due(now) {
            return false;
        }
        self.handle.send(HEARTBEAT_BYTES);
        self.io.bytes_out += HEARTBEAT_BYTES.len() as u64;
        heartbeat.record_sent(now);
        true
    }

    pub fn is_heart_beat_timeout(&self, now: Instant) -> bool {
        self.heartbeat
            .as_ref()
            .is_some_and(|heartbeat| heartbeat.is_timed_out(now))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn take_io_stats(&mut self) -> IoStats {
        std::mem::take(&mut self.io)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("login", &self.login)
            .field("open_transactions", &self.transactions.len())
            .finish()
    }
}
