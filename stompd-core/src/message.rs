//! Application messages routed through exchanges.

use crate::destination::Destination;
use bytes::Bytes;
use std::time::{Duration, Instant};
use stompd_protocol::header;
use stompd_protocol::{Command, Frame, Headers};
use uuid::Uuid;

/// A MESSAGE frame plus the routing and delivery state the broker tracks.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    destination: Destination,
    transaction: Option<String>,
    frame: Frame,
    /// Idle time after which the message may be expired (`None` = never).
    inactivity_timeout: Option<Duration>,
    created_at: Instant,
    last_activity: Instant,
    sent_at: Option<Instant>,
    attempts: u32,
}

impl Message {
    /// Creates a message with a fresh time-ordered id.
    pub fn new(destination: Destination, body: impl Into<Bytes>) -> Self {
        let id = Uuid::now_v7().to_string();
        let frame = Frame::from_command(Command::Message)
            .with_header(header::DESTINATION, destination.to_string())
            .with_header(header::MESSAGE_ID, id.as_str())
            .with_body(body);
        let now = frame.created_at();

        Self {
            id,
            destination,
            transaction: None,
            frame,
            inactivity_timeout: None,
            created_at: now,
            last_activity: now,
            sent_at: None,
            attempts: 0,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    /// Copies headers from the publishing frame.
    ///
    /// `message-id` and `destination` always keep the broker's values and
    /// `receipt` is not forwarded to subscribers.
    pub fn copy_headers_from(&mut self, headers: &Headers) {
        let headers_mut = self.frame.headers_mut();
        headers_mut.copy_from(headers);
        headers_mut.remove(header::RECEIPT);
        headers_mut.replace(header::MESSAGE_ID, self.id.as_str());
        headers_mut.replace(header::DESTINATION, self.destination.to_string());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn transaction(&self) -> Option<&str> {
        self.transaction.as_deref()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn headers(&self) -> &Headers {
        self.frame.headers()
    }

    pub fn body(&self) -> &Bytes {
        self.frame.body()
    }

    /// Bytes counted against an exchange's byte limit.
    pub fn body_len(&self) -> usize {
        self.frame.body().len()
    }

    pub fn requires_response(&self) -> bool {
        self.frame.requires_response()
    }

    pub fn set_requires_response(&mut self, requires_response: bool) {
        self.frame.set_requires_response(requires_response);
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns whether the message has sat idle past its timeout.
    pub fn is_inactive(&self, now: Instant) -> bool {
        match self.inactivity_timeout {
            Some(timeout) => now.saturating_duration_since(self.last_activity) >= timeout,
            None => false,
        }
    }

    /// Records a delivery attempt.
    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.sent_at = Some(now);
        self.last_activity = now;
        self.frame.touch(now);
    }

    /// Copy handed to one broadcast recipient; never awaits an ack.
    pub fn broadcast_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.set_requires_response(false);
        copy
    }

    /// Builds the outbound MESSAGE frame for a subscription.
    pub fn to_frame(&self, subscription_id: &str) -> Frame {
        let mut frame = self.frame.clone();
        frame
            .headers_mut()
            .replace(header::SUBSCRIPTION, subscription_id);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_headers() {
        let message = Message::new(Destination::queue("orders"), "payload");
        assert_eq!(message.frame().kind(), Command::Message);
        assert_eq!(message.headers().get("destination"), Some("queue/orders"));
        assert_eq!(message.headers().get("message-id"), Some(message.id()));
        assert_eq!(message.body_len(), 7);
        assert!(message.requires_response());
        assert_eq!(message.attempts(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::new(Destination::queue("a"), "");
        let b = Message::new(Destination::queue("a"), "");
        assert_ne!(a.id(), b.id());
        assert_eq!(Uuid::parse_str(a.id()).unwrap().get_version_num(), 7);
    }

    #[test]
    fn test_transaction_tag() {
        let plain = Message::new(Destination::queue("a"), "x");
        assert_eq!(plain.transaction(), None);

        let tagged = Message::new(Destination::queue("a"), "x").with_transaction("tx-1");
        assert_eq!(tagged.transaction(), Some("tx-1"));
        assert_eq!(tagged.broadcast_copy().transaction(), Some("tx-1"));
    }

    #[test]
    fn test_copy_headers_keeps_identity() {
        let mut message = Message::new(Destination::queue("orders"), "x");
        let id = message.id().to_string();

        let mut headers = Headers::new();
        headers.add("destination", "/queue/orders");
        headers.add("message-id", "forged");
        headers.add("receipt", "r-1");
        headers.add("x-trace", "abc");
        message.copy_headers_from(&headers);

        assert_eq!(message.headers().get("message-id"), Some(id.as_str()));
        assert_eq!(message.headers().get("destination"), Some("queue/orders"));
        assert_eq!(message.headers().get("x-trace"), Some("abc"));
        assert!(message.headers().get("receipt").is_none());
    }

    #[test]
    fn test_inactivity() {
        let message = Message::new(Destination::queue("a"), "")
            .with_inactivity_timeout(Duration::from_secs(10));
        let start = message.last_activity();
        assert!(!message.is_inactive(start + Duration::from_secs(9)));
        assert!(message.is_inactive(start + Duration::from_secs(10)));

        let message = Message::new(Destination::topic("a"), "");
        assert!(!message.is_inactive(start + Duration::from_secs(86_400)));

        let message =
            Message::new(Destination::topic("a"), "").with_inactivity_timeout(Duration::ZERO);
        assert!(message.inactivity_timeout().is_none());
    }

    #[test]
    fn test_record_attempt_and_frame() {
        let mut message = Message::new(Destination::queue("a"), "body");
        let now = Instant::now();
        message.record_attempt(now);
        message.record_attempt(now);
        assert_eq!(message.attempts(), 2);
        assert_eq!(message.sent_at(), Some(now));

        let frame = message.to_frame("sub-1");
        assert_eq!(frame.header("subscription"), Some("sub-1"));
        assert!(message.headers().get("subscription").is_none());
    }

    #[test]
    fn test_broadcast_copy_is_independent() {
        let message = Message::new(Destination::topic("news"), "x");
        let copy = message.broadcast_copy();
        assert!(!copy.requires_response());
        assert!(message.requires_response());
        assert_eq!(copy.id(), message.id());
    }
}
