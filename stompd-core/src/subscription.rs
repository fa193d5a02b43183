//! Subscriptions and their delivery queues.
//!
//! Each subscription owns three queues and a message lives in at most one of
//! them at a time:
//!
//! - *pending*: routed by an exchange, not yet written to the peer
//! - *awaiting ack*: written to the peer, acknowledgement outstanding
//! - *dead*: nacked, waiting to be recovered into the exchange

use crate::destination::Destination;
use crate::error::CoreError;
use crate::message::Message;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use stompd_protocol::Frame;

/// Identifies a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Arena index of a subscription owned by the router.
///
/// Keys are handed out in increasing order, so iterating a
/// [`SubscriptionTable`] visits subscriptions oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(pub u64);

/// All live subscriptions, keyed by arena index.
pub type SubscriptionTable = BTreeMap<SubscriptionKey, Subscription>;

/// How a subscriber acknowledges delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Delivery counts as acknowledgement.
    #[default]
    Auto,
    /// ACK/NACK apply to the named message and everything older.
    Client,
    /// ACK/NACK apply to the named message only.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(CoreError::InvalidAckMode(other.to_string())),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
}

/// A peer's registered interest in a destination pattern.
#[derive(Debug)]
pub struct Subscription {
    peer: PeerId,
    id: String,
    pattern: Destination,
    ack_mode: AckMode,
    /// Maximum unacknowledged messages (0 = unlimited).
    prefetch: usize,
    pending: VecDeque<Message>,
    awaiting_ack: VecDeque<Message>,
    dead: VecDeque<Message>,
    stats: SubscriptionStats,
}

impl Subscription {
    pub fn new(peer: PeerId, id: impl Into<String>, pattern: Destination, ack_mode: AckMode) -> Self {
        Self {
            peer,
            id: id.into(),
            pattern,
            ack_mode,
            prefetch: 0,
            pending: VecDeque::new(),
            awaiting_ack: VecDeque::new(),
            dead: VecDeque::new(),
            stats: SubscriptionStats::default(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &Destination {
        &self.pattern
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn awaiting_ack_len(&self) -> usize {
        self.awaiting_ack.len()
    }

    pub fn dead_len(&self) -> usize {
        self.dead.len()
    }

    /// Returns whether the subscription's pattern covers `destination`.
    pub fn matches(&self, destination: &Destination) -> bool {
        self.pattern.matches(destination)
    }

    /// Messages routed here that still count against prefetch: pending and
    /// awaiting ack when acks are required.
    pub fn unacked_len(&self) -> usize {
        if self.ack_mode.requires_ack() {
            self.pending.len() + self.awaiting_ack.len()
        } else {
            self.awaiting_ack.len()
        }
    }

    /// Returns whether an exchange may route another message here.
    pub fn prefetch_ok(&self) -> bool {
        self.prefetch == 0 || self.unacked_len() < self.prefetch
    }

    pub fn enqueue(&mut self, message: Message) {
        self.pending.push_back(message);
        self.stats.enqueued += 1;
    }

    /// Takes the oldest pending message and returns the frame to write.
    ///
    /// Messages that need acknowledgement move to the awaiting-ack queue;
    /// the rest are released here.
    pub fn dequeue_for_send(&mut self, now: Instant) -> Option<Frame> {
        let mut message = self.pending.pop_front()?;
        message.record_attempt(now);
        let frame = message.to_frame(&self.id);
        self.stats.delivered += 1;

        if message.requires_response() && self.ack_mode.requires_ack() {
            self.awaiting_ack.push_back(message);
        }
        Some(frame)
    }

    /// Acknowledges a delivered message. Returns how many were released.
    pub fn ack(&mut self, message_id: &str) -> usize {
        let released = self.take_acknowledged(message_id).len();
        self.stats.acked += released as u64;
        released
    }

    /// Rejects a delivered message, moving it to the dead queue for
    /// redelivery. Returns how many were moved.
    pub fn nack(&mut self, message_id: &str) -> usize {
        let rejected = self.take_acknowledged(message_id);
        let count = rejected.len();
        self.dead.extend(rejected);
        self.stats.nacked += count as u64;
        count
    }

    /// Removes the messages an ACK or NACK for `message_id` covers.
    fn take_acknowledged(&mut self, message_id: &str) -> Vec<Message> {
        let Some(pos) = self.awaiting_ack.iter().position(|m| m.id() == message_id) else {
            return Vec::new();
        };

        match self.ack_mode {
            AckMode::ClientIndividual => self.awaiting_ack.remove(pos).into_iter().collect(),
            _ => self.awaiting_ack.drain(..=pos).collect(),
        }
    }

    /// Takes up to `limit` dead messages routed from `destination`, oldest
    /// first. Dead messages from other destinations stay in place.
    pub fn drain_dead_for(&mut self, destination: &Destination, limit: usize) -> Vec<Message> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.dead.len());
        for message in self.dead.drain(..) {
            if taken.len() < limit && message.destination() == destination {
                taken.push(message);
            } else {
                kept.push_back(message);
            }
        }
        self.dead = kept;
        taken
    }

    /// Takes every queued message that was routed from `destination`,
    /// oldest first: dead, then awaiting ack, then pending.
    pub fn drain_for(&mut self, destination: &Destination) -> Vec<Message> {
        let mut taken = Vec::new();
        extract(&mut self.dead, destination, &mut taken);
        extract(&mut self.awaiting_ack, destination, &mut taken);
        extract(&mut self.pending, destination, &mut taken);
        taken
    }
}

fn extract(queue: &mut VecDeque<Message>, destination: &Destination, out: &mut Vec<Message>) {
    if queue.iter().all(|m| m.destination() == destination) {
        out.extend(queue.drain(..));
        return;
    }
    let mut kept = VecDeque::with_capacity(queue.len());
    for message in queue.drain(..) {
        if message.destination() == destination {
            out.push(message);
        } else {
            kept.push_back(message);
        }
    }
    *queue = kept;
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscription id={} pattern={} peer={} ack={} pending={} awaiting={} dead={}",
            self.id,
            self.pattern,
            self.peer,
            self.ack_mode,
            self.pending.len(),
            self.awaiting_ack.len(),
            self.dead.len()
        )
    }
}
