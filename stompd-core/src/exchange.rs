//! Per-destination message queue and dispatch.
//!
//! An exchange holds messages posted to one destination until they are
//! handed to subscriptions. Queue destinations use fanout routing
//! (competing consumers), topic destinations use broadcast routing.

use crate::destination::{Destination, DestinationKind};
use crate::message::Message;
use crate::subscription::{Subscription, SubscriptionKey, SubscriptionTable};
use std::collections::VecDeque;
use std::fmt;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

/// Dead messages taken from one subscription per recovery pass.
pub const RECOVER_DEAD_BATCH: usize = 100;

/// Upper bound on the wait before the next expiry run when a scan was cut
/// short by the expire limit.
const EXPIRE_CATCHUP: Duration = Duration::from_secs(1);

/// Routing strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Each message goes to exactly one eligible subscription.
    Fanout,
    /// Each message is copied to every eligible subscription.
    Topic,
}

impl ExchangeType {
    pub fn for_kind(kind: DestinationKind) -> Self {
        match kind {
            DestinationKind::Queue => ExchangeType::Fanout,
            DestinationKind::Topic => ExchangeType::Topic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits and timers for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Send-queue size in body bytes above which the oldest messages expire.
    pub byte_limit: usize,
    /// Minimum time between expiry runs.
    pub expire_interval: Duration,
    /// Maximum messages inspected by one expiry run.
    pub expire_limit: usize,
    /// Pause after a fanout pass that deferred messages.
    pub deferred_interval: Duration,
    /// Minimum time between dead-message recovery runs.
    pub recover_dead_interval: Duration,
    /// How often accumulated statistics are reported.
    pub stats_interval: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            byte_limit: 3 * 1024 * 1024,
            expire_interval: Duration::from_secs(5),
            expire_limit: 20_000,
            deferred_interval: Duration::from_millis(10),
            recover_dead_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(10),
        }
    }
}

/// Work done by one dispatch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages handed to subscriptions (one per topic copy).
    pub dispatched: usize,
    /// Fanout messages held back for lack of an eligible subscription.
    pub deferred: usize,
    /// Topic messages discarded for lack of an eligible subscription.
    pub dropped: usize,
    pub expired: usize,
    pub recovered: usize,
}

impl DispatchReport {
    /// Returns whether anything moved.
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.dropped == 0 && self.expired == 0 && self.recovered == 0
    }
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.dispatched += other.dispatched;
        self.deferred += other.deferred;
        self.dropped += other.dropped;
        self.expired += other.expired;
        self.recovered += other.recovered;
    }
}

/// Counters accumulated between statistics reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub posted: u64,
    pub dispatched: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub expired: u64,
    pub dead_recovered: u64,
}

#[derive(Debug)]
enum Routing {
    Fanout { cursor: usize },
    Topic,
}

impl Routing {
    fn for_type(exchange_type: ExchangeType) -> Self {
        match exchange_type {
            ExchangeType::Fanout => Routing::Fanout { cursor: 0 },
            ExchangeType::Topic => Routing::Topic,
        }
    }

    fn exchange_type(&self) -> ExchangeType {
        match self {
            Routing::Fanout { .. } => ExchangeType::Fanout,
            Routing::Topic => ExchangeType::Topic,
        }
    }
}

/// Message queue for a single destination.
#[derive(Debug)]
pub struct Exchange {
    destination: Destination,
    routing: Routing,
    config: ExchangeConfig,

    /// Subscriptions eligible for this exchange, in bind order.
    bindings: Vec<SubscriptionKey>,

    send_queue: VecDeque<Message>,
    /// Holds fanout messages during one pass; always empty between calls.
    deferred: VecDeque<Message>,
    /// Sum of body lengths in `send_queue`.
    bytes: usize,

    dispatch_after: Option<Instant>,
    next_expire_at: Instant,
    next_recover_dead_at: Instant,

    stats: ExchangeStats,
    last_stats_at: Instant,
}

impl Exchange {
    /// Creates an exchange routed according to the destination's kind.
    pub fn new(destination: Destination, config: ExchangeConfig, now: Instant) -> Self {
        let exchange_type = ExchangeType::for_kind(destination.kind());
        Self::with_type(destination, exchange_type, config, now)
    }

    pub fn with_type(
        destination: Destination,
        exchange_type: ExchangeType,
        config: ExchangeConfig,
        now: Instant,
    ) -> Self {
        Self {
            destination,
            routing: Routing::for_type(exchange_type),
            config,
            bindings: Vec::new(),
            send_queue: VecDeque::new(),
            deferred: VecDeque::new(),
            bytes: 0,
            dispatch_after: None,
            next_expire_at: now,
            next_recover_dead_at: now,
            stats: ExchangeStats::default(),
            last_stats_at: now,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.routing.exchange_type()
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn bindings(&self) -> &[SubscriptionKey] {
        &self.bindings
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_bound(&self, key: SubscriptionKey) -> bool {
        self.bindings.contains(&key)
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Ids in the send queue, front first.
    pub fn queued_ids(&self) -> impl Iterator<Item = &str> {
        self.send_queue.iter().map(|m| m.id())
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn byte_limit(&self) -> usize {
        self.config.byte_limit
    }

    pub fn set_byte_limit(&mut self, byte_limit: usize) {
        self.config.byte_limit = byte_limit;
    }

    pub fn is_over_byte_limit(&self) -> bool {
        self.bytes > self.config.byte_limit
    }

    // =========================================================================
    // Queue and Bindings
    // =========================================================================

    /// Appends a message to the send queue.
    pub fn post(&mut self, message: Message) {
        self.push_back(message);
        self.stats.posted += 1;
    }

    /// Binds a subscription. Returns `false` if it was already bound.
    pub fn bind(&mut self, key: SubscriptionKey) -> bool {
        if self.is_bound(key) {
            return false;
        }
        self.bindings.push(key);
        true
    }

    /// Unbinds a subscription. On a fanout exchange every message it holds
    /// from this exchange goes back to the front of the send queue; topic
    /// copies are discarded.
    ///
    /// Returns the number of messages recovered, or `None` if it was not bound.
    pub fn unbind(&mut self, key: SubscriptionKey, subs: &mut SubscriptionTable) -> Option<usize> {
        let pos = self.bindings.iter().position(|k| *k == key)?;
        self.bindings.remove(pos);

        let drained = match subs.get_mut(&key) {
            Some(sub) => sub.drain_for(&self.destination),
            None => Vec::new(),
        };
        Some(self.reclaim(drained))
    }

    /// Unbinds everything. Returns the number of messages recovered.
    pub fn unbind_all(&mut self, subs: &mut SubscriptionTable) -> usize {
        let keys = std::mem::take(&mut self.bindings);
        let mut drained = Vec::new();
        for key in keys {
            if let Some(sub) = subs.get_mut(&key) {
                drained.extend(sub.drain_for(&self.destination));
            }
        }
        self.reclaim(drained)
    }

    /// Re-queues messages taken from an unbound subscription.
    fn reclaim(&mut self, messages: Vec<Message>) -> usize {
        match self.routing {
            Routing::Fanout { .. } => {
                let count = messages.len();
                self.push_front_ordered(messages);
                count
            }
            Routing::Topic => {
                if !messages.is_empty() {
                    tracing::debug!(
                        exchange = %self.destination,
                        count = messages.len(),
                        "Dropped undelivered topic copies"
                    );
                    self.stats.dropped += messages.len() as u64;
                }
                0
            }
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Runs expiry, dead recovery, and then routes up to `limit` messages.
    pub fn dispatch(
        &mut self,
        limit: usize,
        subs: &mut SubscriptionTable,
        now: Instant,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            expired: self.expire_inactive(now),
            recovered: self.recover_dead(subs, now),
            ..Default::default()
        };

        match self.routing {
            Routing::Fanout { .. } => self.dispatch_fanout(limit, subs, now, &mut report),
            Routing::Topic => self.dispatch_topic(limit, subs, &mut report),
        }

        self.stats.dispatched += report.dispatched as u64;
        self.stats.deferred += report.deferred as u64;
        self.stats.dropped += report.dropped as u64;
        report
    }

    fn dispatch_fanout(
        &mut self,
        limit: usize,
        subs: &mut SubscriptionTable,
        now: Instant,
        report: &mut DispatchReport,
    ) {
        if self.bindings.is_empty() || self.send_queue.is_empty() {
            return;
        }
        if self.dispatch_after.is_some_and(|at| now < at) {
            return;
        }
        self.dispatch_after = None;

        for _ in 0..limit {
            let Some(message) = self.pop_front() else {
                break;
            };

            let matches = self.find_matches(&message, subs);
            if matches.is_empty() {
                self.deferred.push_back(message);
                report.deferred += 1;
                continue;
            }

            let index = match &mut self.routing {
                Routing::Fanout { cursor } => {
                    let index = *cursor % matches.len();
                    *cursor = cursor.wrapping_add(1);
                    index
                }
                Routing::Topic => unreachable!("fanout pass on a topic exchange"),
            };
            bound_mut(subs, matches[index]).enqueue(message);
            report.dispatched += 1;
        }

        if !self.deferred.is_empty() {
            let deferred: Vec<Message> = self.deferred.drain(..).collect();
            self.push_front_ordered(deferred);
            self.dispatch_after = Some(now + self.config.deferred_interval);
        }
    }

    fn dispatch_topic(
        &mut self,
        limit: usize,
        subs: &mut SubscriptionTable,
        report: &mut DispatchReport,
    ) {
        for _ in 0..limit {
            let Some(message) = self.pop_front() else {
                break;
            };

            let matches = self.find_matches(&message, subs);
            if matches.is_empty() {
                report.dropped += 1;
                continue;
            }
            for key in matches {
                bound_mut(subs, key).enqueue(message.broadcast_copy());
                report.dispatched += 1;
            }
        }
    }

    /// Bound subscriptions that match the message and can take another one.
    fn find_matches(&self, message: &Message, subs: &SubscriptionTable) -> Vec<SubscriptionKey> {
        self.bindings
            .iter()
            .copied()
            .filter(|key| {
                let sub = bound(subs, *key);
                sub.matches(message.destination()) && sub.prefetch_ok()
            })
            .collect()
    }

    // =========================================================================
    // Expiry and Recovery
    // =========================================================================

    /// Expires messages from the front of the send queue that are inactive
    /// or keep the exchange over its byte limit. Returns how many expired.
    pub fn expire_inactive(&mut self, now: Instant) -> usize {
        if now < self.next_expire_at {
            return 0;
        }

        let mut scanned = 0;
        let mut expired = 0;
        while scanned < self.config.expire_limit {
            let Some(front) = self.send_queue.front() else {
                break;
            };
            if !front.is_inactive(now) && !self.is_over_byte_limit() {
                break;
            }
            scanned += 1;
            if let Some(message) = self.pop_front() {
                tracing::trace!(
                    exchange = %self.destination,
                    message_id = %message.id(),
                    "Message expired"
                );
                expired += 1;
            }
        }

        let wait = if scanned >= self.config.expire_limit {
            self.config.expire_interval.min(EXPIRE_CATCHUP)
        } else {
            self.config.expire_interval
        };
        self.next_expire_at = now + wait;
        self.stats.expired += expired as u64;
        expired
    }

    /// Moves this exchange's dead messages from bound subscriptions back to
    /// the front of the send queue. Returns how many were recovered.
    pub fn recover_dead(&mut self, subs: &mut SubscriptionTable, now: Instant) -> usize {
        if now < self.next_recover_dead_at {
            return 0;
        }

        let mut recovered = Vec::new();
        let mut more_waiting = false;
        for key in &self.bindings {
            let dead =
                bound_mut(subs, *key).drain_dead_for(&self.destination, RECOVER_DEAD_BATCH);
            more_waiting |= dead.len() == RECOVER_DEAD_BATCH;
            recovered.extend(dead);
        }

        self.next_recover_dead_at = if more_waiting {
            now
        } else {
            now + self.config.recover_dead_interval
        };

        let count = recovered.len();
        if count > 0 {
            tracing::debug!(exchange = %self.destination, count, "Recovered dead messages");
        }
        self.push_front_ordered(recovered);
        self.stats.dead_recovered += count as u64;
        count
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Returns and resets the accumulated counters once the stats interval
    /// has elapsed.
    pub fn take_stats(&mut self, now: Instant) -> Option<ExchangeStats> {
        if now.saturating_duration_since(self.last_stats_at) < self.config.stats_interval {
            return None;
        }
        self.last_stats_at = now;
        Some(std::mem::take(&mut self.stats))
    }

    // =========================================================================
    // Byte Accounting
    // =========================================================================

    fn push_back(&mut self, message: Message) {
        self.bytes += message.body_len();
        self.send_queue.push_back(message);
    }

    /// Re-inserts messages at the front so that `messages[0]` ends up first.
    fn push_front_ordered(&mut self, messages: Vec<Message>) {
        for message in messages.into_iter().rev() {
            self.bytes += message.body_len();
            self.send_queue.push_front(message);
        }
    }

    fn pop_front(&mut self) -> Option<Message> {
        let message = self.send_queue.pop_front()?;
        match self.bytes.checked_sub(message.body_len()) {
            Some(bytes) => self.bytes = bytes,
            None => panic!(
                "byte accounting underflow on {}: {} queued, {} released",
                self.destination,
                self.bytes,
                message.body_len()
            ),
        }
        Some(message)
    }
}

fn bound(subs: &SubscriptionTable, key: SubscriptionKey) -> &Subscription {
    match subs.get(&key) {
        Some(sub) => sub,
        None => panic!("bound subscription {:?} missing from table", key),
    }
}

fn bound_mut(subs: &mut SubscriptionTable, key: SubscriptionKey) -> &mut Subscription {
    match subs.get_mut(&key) {
        Some(sub) => sub,
        None => panic!("bound subscription {:?} missing from table", key),
    }
}
