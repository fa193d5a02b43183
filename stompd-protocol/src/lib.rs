//! # stompd-protocol
//!
//! STOMP wire protocol implementation for stompd.
//!
//! This crate provides:
//! - Frame, command and header representation
//! - Frame encoding with a computed `content-length`
//! - An incremental stream parser that resumes across partial reads
//! - Heart-beat negotiation and liveness timing
//! - Error codes reported in ERROR frames

pub mod error;
pub mod frame;
pub mod header;
pub mod heartbeat;
pub mod parser;

pub use error::{ErrorCode, ProtocolError};
pub use frame::{Command, Frame};
pub use header::{Header, Headers};
pub use heartbeat::{HeartBeat, HeartBeatPolicy, Negotiated, HEARTBEAT_BYTES};
pub use parser::StreamParser;

/// STOMP protocol version advertised in CONNECTED frames.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Default port for a STOMP broker.
pub const DEFAULT_PORT: u16 = 61613;

/// Maximum frame body size (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Parser state transitions attempted per drive call.
pub const MAX_PARSE_STEPS: usize = 100;
