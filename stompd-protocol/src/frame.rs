//! STOMP frame representation and encoding.
//!
//! Wire layout:
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...
//! \n
//! <body bytes>\0
//! ```
//!
//! Decoding is incremental and lives in [`crate::parser`].

use crate::header::{self, Headers};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Instant;

/// Frame command type, derived once from the command text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Begin,
    Commit,
    Abort,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
    Unknown,
}

impl Command {
    /// Maps command text to its type. Matching is exact; anything
    /// unrecognized is [`Command::Unknown`].
    pub fn parse(command: &str) -> Self {
        match command {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => Command::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Unknown => "UNKNOWN",
        }
    }

    /// Commands that may be held back in an open transaction.
    pub fn is_transactable(&self) -> bool {
        matches!(self, Command::Send | Command::Ack | Command::Nack)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    command: String,
    kind: Command,
    headers: Headers,
    body: Bytes,
    created_at: Instant,
    updated_at: Instant,
    /// Whether delivery must be acknowledged by the receiver.
    requires_response: bool,
    /// Set once the frame has been buffered by a transaction.
    in_transaction: bool,
}

impl Frame {
    /// Creates an empty frame for the given command text.
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        let kind = Command::parse(&command);
        let now = Instant::now();
        Self {
            command,
            kind,
            headers: Headers::new(),
            body: Bytes::new(),
            created_at: now,
            updated_at: now,
            requires_response: true,
            in_transaction: false,
        }
    }

    pub fn from_command(kind: Command) -> Self {
        Self::new(kind.as_str())
    }

    /// Assembles a frame from parsed components.
    pub fn from_parts(command: String, headers: Headers, body: Bytes) -> Self {
        let mut frame = Self::new(command);
        frame.headers = headers;
        frame.body = body;
        frame
    }

    /// Builds an ERROR frame with a short `message` header and a text body.
    pub fn error(message: &str, detail: &str) -> Self {
        Self::from_command(Command::Error)
            .with_header(header::MESSAGE, message)
            .with_body(Bytes::copy_from_slice(detail.as_bytes()))
    }

    /// Builds a RECEIPT frame for the given receipt id.
    pub fn receipt(receipt_id: &str) -> Self {
        Self::from_command(Command::Receipt).with_header(header::RECEIPT_ID, receipt_id)
    }

    /// Adds a header (first occurrence wins).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn kind(&self) -> Command {
        self.kind
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Shorthand for `headers().get(name)`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.updated_at = Instant::now();
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    /// Records activity on the frame.
    pub fn touch(&mut self, now: Instant) {
        self.updated_at = now;
    }

    pub fn requires_response(&self) -> bool {
        self.requires_response
    }

    pub fn set_requires_response(&mut self, requires_response: bool) {
        self.requires_response = requires_response;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn mark_in_transaction(&mut self) {
        self.in_transaction = true;
    }

    /// Encodes the frame for the wire.
    ///
    /// `content-length` always reflects the current body; an existing header
    /// keeps its position, otherwise it is appended after the other headers.
    pub fn encode(&self) -> BytesMut {
        let length = self.body.len().to_string();
        let mut buf = BytesMut::with_capacity(self.encoded_size_hint());

        buf.put_slice(self.command.as_bytes());
        buf.put_u8(b'\n');

        let mut wrote_length = false;
        for header in self.headers.iter() {
            buf.put_slice(header.name.as_bytes());
            buf.put_u8(b':');
            if header.is(header::CONTENT_LENGTH) {
                buf.put_slice(length.as_bytes());
                wrote_length = true;
            } else {
                buf.put_slice(header.value.as_bytes());
            }
            buf.put_u8(b'\n');
        }
        if !wrote_length {
            buf.put_slice(header::CONTENT_LENGTH.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(length.as_bytes());
            buf.put_u8(b'\n');
        }

        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.put_u8(0);
        buf
    }

    fn encoded_size_hint(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|h| h.name.len() + h.value.len() + 2)
            .sum();
        self.command.len() + headers + self.body.len() + 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("SEND"), Command::Send);
        assert_eq!(Command::parse("STOMP"), Command::Stomp);
        assert_eq!(Command::parse("send"), Command::Unknown);
        assert_eq!(Command::parse("BOGUS"), Command::Unknown);
        assert_eq!(Command::Subscribe.to_string(), "SUBSCRIBE");
    }

    #[test]
    fn test_kind_follows_command_text() {
        let frame = Frame::new("NACK");
        assert_eq!(frame.kind(), Command::Nack);
        assert_eq!(frame.command(), "NACK");

        let frame = Frame::new("FROB");
        assert_eq!(frame.kind(), Command::Unknown);
        assert_eq!(frame.command(), "FROB");
    }

    #[test]
    fn test_frame_defaults() {
        let frame = Frame::from_command(Command::Send);
        assert!(frame.requires_response());
        assert!(!frame.in_transaction());
        assert!(frame.body().is_empty());
        assert!(frame.headers().is_empty());
    }

    #[test]
    fn test_encode_appends_content_length() {
        let frame = Frame::from_command(Command::Send)
            .with_header("destination", "queue/a")
            .with_body("hello");

        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            b"SEND\ndestination:queue/a\ncontent-length:5\n\nhello\0"
        );
    }

    #[test]
    fn test_encode_recomputes_stale_content_length() {
        let frame = Frame::from_command(Command::Send)
            .with_header("Content-Length", "999")
            .with_header("destination", "queue/a")
            .with_body("abc");

        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            b"SEND\nContent-Length:3\ndestination:queue/a\n\nabc\0"
        );
    }

    #[test]
    fn test_error_and_receipt_frames() {
        let frame = Frame::error("destination invalid", "SEND");
        assert_eq!(frame.kind(), Command::Error);
        assert_eq!(frame.header("message"), Some("destination invalid"));
        assert_eq!(&frame.body()[..], b"SEND");

        let frame = Frame::receipt("r-7");
        assert_eq!(frame.kind(), Command::Receipt);
        assert_eq!(frame.header("receipt-id"), Some("r-7"));
    }

    #[test]
    fn test_transactable_commands() {
        assert!(Command::Send.is_transactable());
        assert!(Command::Ack.is_transactable());
        assert!(Command::Nack.is_transactable());
        assert!(!Command::Subscribe.is_transactable());
        assert!(!Command::Commit.is_transactable());
    }
}
