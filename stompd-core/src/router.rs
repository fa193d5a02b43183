//! Exchange registry and subscription arena.
//!
//! The router owns every exchange and every subscription. Exchanges refer to
//! subscriptions by [`SubscriptionKey`]; nothing else holds a subscription.

use crate::destination::{Destination, DestinationKind};
use crate::error::CoreError;
use crate::exchange::{DispatchReport, Exchange, ExchangeConfig, ExchangeType};
use crate::message::Message;
use crate::subscription::{PeerId, Subscription, SubscriptionKey, SubscriptionTable};
use crate::telemetry::{Counter, Gauge, NoopTelemetry, Telemetry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use stompd_protocol::Frame;
use tracing::{debug, info};

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Settings for exchanges behind `queue/...` destinations.
    pub queue: ExchangeConfig,
    /// Settings for exchanges behind `topic/...` destinations.
    pub topic: ExchangeConfig,
    /// Messages routed per exchange per tick.
    pub dispatch_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue: ExchangeConfig::default(),
            topic: ExchangeConfig::default(),
            dispatch_limit: 100,
        }
    }
}

impl RouterConfig {
    pub fn exchange_config(&self, kind: DestinationKind) -> &ExchangeConfig {
        match kind {
            DestinationKind::Queue => &self.queue,
            DestinationKind::Topic => &self.topic,
        }
    }
}

/// Destination table plus the subscriptions bound into it.
pub struct Router {
    config: RouterConfig,
    exchanges: BTreeMap<Destination, Exchange>,
    subscriptions: SubscriptionTable,
    by_peer: HashMap<PeerId, BTreeSet<SubscriptionKey>>,
    next_key: u64,
    telemetry: Arc<dyn Telemetry>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            exchanges: BTreeMap::new(),
            subscriptions: SubscriptionTable::new(),
            by_peer: HashMap::new(),
            next_key: 1,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // =========================================================================
    // Exchanges
    // =========================================================================

    /// Returns the exchange for `destination`, creating it if needed.
    ///
    /// A new exchange is immediately bound to every stored subscription whose
    /// pattern covers it.
    pub fn create_exchange(
        &mut self,
        destination: Destination,
        exchange_type: ExchangeType,
        now: Instant,
    ) -> &mut Exchange {
        if !self.exchanges.contains_key(&destination) {
            let config = self.config.exchange_config(destination.kind()).clone();
            let mut exchange =
                Exchange::with_type(destination.clone(), exchange_type, config, now);

            let mut bound = 0;
            for (key, sub) in &self.subscriptions {
                if sub.matches(&destination) && exchange.bind(*key) {
                    bound += 1;
                }
            }
            info!(
                exchange = %destination,
                exchange_type = %exchange_type,
                bound,
                "Created exchange"
            );
            self.exchanges.insert(destination.clone(), exchange);
            self.telemetry
                .gauge(Gauge::Exchanges, "", self.exchanges.len() as f64);
        }

        match self.exchanges.get_mut(&destination) {
            Some(exchange) => exchange,
            None => unreachable!("exchange {} inserted above", destination),
        }
    }

    /// Removes an exchange and the messages still queued in it.
    pub fn destroy_exchange(&mut self, destination: &Destination) -> bool {
        let Some(exchange) = self.exchanges.remove(destination) else {
            return false;
        };
        info!(
            exchange = %destination,
            discarded = exchange.send_queue_len(),
            "Destroyed exchange"
        );
        self.telemetry
            .gauge(Gauge::Exchanges, "", self.exchanges.len() as f64);
        true
    }

    pub fn exchange(&self, destination: &Destination) -> Option<&Exchange> {
        self.exchanges.get(destination)
    }

    pub fn exchange_mut(&mut self, destination: &Destination) -> Option<&mut Exchange> {
        self.exchanges.get_mut(destination)
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.values()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Posts a message to its destination's exchange, creating it on demand.
    pub fn post(&mut self, message: Message, now: Instant) {
        let destination = message.destination().clone();
        let exchange_type = ExchangeType::for_kind(destination.kind());
        self.create_exchange(destination.clone(), exchange_type, now)
            .post(message);
        self.telemetry
            .incr(Counter::MessagesPosted, &destination.to_string(), 1);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Stores a subscription and binds it to every matching exchange.
    ///
    /// A pattern without wildcards also creates its exchange.
    pub fn subscribe(
        &mut self,
        sub: Subscription,
        now: Instant,
    ) -> Result<SubscriptionKey, CoreError> {
        if self.find_subscription(sub.peer(), sub.id()).is_some() {
            return Err(CoreError::DuplicateSubscription {
                id: sub.id().to_string(),
            });
        }

        let key = SubscriptionKey(self.next_key);
        self.next_key += 1;

        let pattern = sub.pattern().clone();
        let peer = sub.peer();
        info!(peer = %peer, subscription = %sub, "Stored subscription");
        self.subscriptions.insert(key, sub);
        self.by_peer.entry(peer).or_default().insert(key);

        if is_literal(pattern.key()) {
            let exchange_type = ExchangeType::for_kind(pattern.kind());
            self.create_exchange(pattern, exchange_type, now);
        }

        let mut bound = 0;
        for exchange in self.exchanges.values_mut() {
            let Some(sub) = self.subscriptions.get(&key) else {
                break;
            };
            if sub.matches(exchange.destination()) {
                exchange.bind(key);
                bound += 1;
            }
        }
        debug!(peer = %peer, bound, "Bound subscription");

        self.telemetry
            .gauge(Gauge::Subscriptions, "", self.subscriptions.len() as f64);
        Ok(key)
    }

    pub fn find_subscription(&self, peer: PeerId, id: &str) -> Option<SubscriptionKey> {
        self.by_peer
            .get(&peer)?
            .iter()
            .copied()
            .find(|key| self.subscriptions.get(key).is_some_and(|sub| sub.id() == id))
    }

    pub fn subscription(&self, key: SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(&key)
    }

    pub fn subscription_mut(&mut self, key: SubscriptionKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(&key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Keys of a peer's subscriptions, oldest first.
    pub fn peer_subscriptions(&self, peer: PeerId) -> Vec<SubscriptionKey> {
        self.by_peer
            .get(&peer)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Unbinds a subscription from every exchange and forgets it.
    ///
    /// Returns the number of in-flight messages handed back to exchanges,
    /// or `None` if the key is unknown.
    pub fn unsubscribe(&mut self, key: SubscriptionKey) -> Option<usize> {
        if !self.subscriptions.contains_key(&key) {
            return None;
        }

        let mut recovered = 0;
        for exchange in self.exchanges.values_mut() {
            recovered += exchange.unbind(key, &mut self.subscriptions).unwrap_or(0);
        }

        let sub = self.subscriptions.remove(&key)?;
        if let Some(keys) = self.by_peer.get_mut(&sub.peer()) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_peer.remove(&sub.peer());
            }
        }
        info!(peer = %sub.peer(), subscription = %sub, recovered, "Forgot subscription");
        self.telemetry
            .gauge(Gauge::Subscriptions, "", self.subscriptions.len() as f64);
        Some(recovered)
    }

    /// Unsubscribes by the peer-scoped subscription id.
    pub fn unsubscribe_id(&mut self, peer: PeerId, id: &str) -> Result<usize, CoreError> {
        self.find_subscription(peer, id)
            .and_then(|key| self.unsubscribe(key))
            .ok_or_else(|| CoreError::SubscriptionNotFound { id: id.to_string() })
    }

    /// Removes every subscription a peer holds. Returns how many.
    pub fn unsubscribe_peer(&mut self, peer: PeerId) -> usize {
        let keys = self.peer_subscriptions(peer);
        keys.into_iter()
            .filter_map(|key| self.unsubscribe(key))
            .count()
    }

    // =========================================================================
    // Acknowledgement
    // =========================================================================

    pub fn ack(
        &mut self,
        peer: PeerId,
        subscription: &str,
        message_id: &str,
    ) -> Result<usize, CoreError> {
        let sub = self.peer_subscription_mut(peer, subscription)?;
        match sub.ack(message_id) {
            0 => Err(message_not_found(subscription, message_id)),
            released => Ok(released),
        }
    }

    pub fn nack(
        &mut self,
        peer: PeerId,
        subscription: &str,
        message_id: &str,
    ) -> Result<usize, CoreError> {
        let sub = self.peer_subscription_mut(peer, subscription)?;
        match sub.nack(message_id) {
            0 => Err(message_not_found(subscription, message_id)),
            rejected => Ok(rejected),
        }
    }

    fn peer_subscription_mut(
        &mut self,
        peer: PeerId,
        id: &str,
    ) -> Result<&mut Subscription, CoreError> {
        self.find_subscription(peer, id)
            .and_then(|key| self.subscriptions.get_mut(&key))
            .ok_or_else(|| CoreError::SubscriptionNotFound { id: id.to_string() })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Runs one dispatch pass over every exchange.
    pub fn dispatch_tick(&mut self, now: Instant) -> DispatchReport {
        let limit = self.config.dispatch_limit;
        let mut total = DispatchReport::default();

        for exchange in self.exchanges.values_mut() {
            let report = exchange.dispatch(limit, &mut self.subscriptions, now);
            let scope = exchange.destination().to_string();
            report_counters(self.telemetry.as_ref(), &scope, &report);
            self.telemetry
                .gauge(Gauge::SendQueueDepth, &scope, exchange.send_queue_len() as f64);
            self.telemetry
                .gauge(Gauge::SendQueueBytes, &scope, exchange.bytes() as f64);

            if let Some(stats) = exchange.take_stats(now) {
                info!(
                    exchange = %scope,
                    posted = stats.posted,
                    dispatched = stats.dispatched,
                    deferred = stats.deferred,
                    dropped = stats.dropped,
                    expired = stats.expired,
                    dead = stats.dead_recovered,
                    queued = exchange.send_queue_len(),
                    bytes = exchange.bytes(),
                    "Exchange stats"
                );
            }
            total += report;
        }
        total
    }

    /// Takes up to `per_subscription` ready frames from each of a peer's
    /// subscriptions.
    pub fn deliveries(
        &mut self,
        peer: PeerId,
        per_subscription: usize,
        now: Instant,
    ) -> Vec<Frame> {
        let mut frames = Vec::new();
        let Some(keys) = self.by_peer.get(&peer) else {
            return frames;
        };

        for key in keys {
            let Some(sub) = self.subscriptions.get_mut(key) else {
                continue;
            };
            for _ in 0..per_subscription {
                match sub.dequeue_for_send(now) {
                    Some(frame) => frames.push(frame),
                    None => break,
                }
            }
        }
        frames
    }

    /// Unsubscribes everything and drops all exchanges.
    pub fn shutdown(&mut self) -> usize {
        let keys: Vec<SubscriptionKey> = self.subscriptions.keys().copied().collect();
        let removed = keys
            .into_iter()
            .filter_map(|key| self.unsubscribe(key))
            .count();
        let exchanges = self.exchanges.len();
        self.exchanges.clear();
        info!(subscriptions = removed, exchanges, "Router shut down");
        removed
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

fn is_literal(key: &str) -> bool {
    !key.contains(&['*', '?'][..])
}

fn message_not_found(subscription: &str, message_id: &str) -> CoreError {
    CoreError::MessageNotFound {
        subscription: subscription.to_string(),
        message_id: message_id.to_string(),
    }
}

fn report_counters(telemetry: &dyn Telemetry, scope: &str, report: &DispatchReport) {
    let counters = [
        (Counter::MessagesDispatched, report.dispatched),
        (Counter::MessagesDeferred, report.deferred),
        (Counter::MessagesDropped, report.dropped),
        (Counter::MessagesExpired, report.expired),
        (Counter::DeadRecovered, report.recovered),
    ];
    for (counter, value) in counters {
        if value > 0 {
            telemetry.incr(counter, scope, value as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::AckMode;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTelemetry {
        counters: Mutex<Vec<(Counter, String, u64)>>,
    }

    impl Telemetry for RecordingTelemetry {
        fn incr(&self, counter: Counter, scope: &str, value: u64) {
            self.counters.lock().push((counter, scope.to_string(), value));
        }

        fn gauge(&self, _gauge: Gauge, _scope: &str, _value: f64) {}
    }

    fn sub(peer: u64, id: &str, pattern: &str, ack_mode: AckMode) -> Subscription {
        Subscription::new(PeerId(peer), id, Destination::parse(pattern).unwrap(), ack_mode)
    }

    fn drain_bodies(router: &mut Router, peer: u64, now: Instant) -> Vec<String> {
        router
            .deliveries(PeerId(peer), 1000, now)
            .iter()
            .map(|f| String::from_utf8_lossy(f.body()).into_owned())
            .collect()
    }

    #[test]
    fn test_post_creates_exchange() {
        let now = Instant::now();
        let mut router = Router::default();
        router.post(Message::new(Destination::queue("a"), "x"), now);
        router.post(Message::new(Destination::queue("a"), "y"), now);

        assert_eq!(router.exchange_count(), 1);
        let exchange = router.exchange(&Destination::queue("a")).unwrap();
        assert_eq!(exchange.exchange_type(), ExchangeType::Fanout);
        assert_eq!(exchange.send_queue_len(), 2);
    }

    #[test]
    fn test_create_exchange_is_idempotent() {
        let now = Instant::now();
        let mut router = Router::default();
        router.post(Message::new(Destination::topic("t"), "x"), now);
        let exchange = router.create_exchange(Destination::topic("t"), ExchangeType::Topic, now);
        assert_eq!(exchange.send_queue_len(), 1);
        assert_eq!(router.exchange_count(), 1);
    }

    #[test]
    fn test_subscription_before_first_send_is_bound() {
        let now = Instant::now();
        let mut router = Router::default();
        let key = router.subscribe(sub(1, "s1", "queue/orders.*", AckMode::Auto), now).unwrap();
        assert_eq!(router.exchange_count(), 0);

        router.post(Message::new(Destination::queue("orders.eu"), "hello"), now);
        let exchange = router.exchange(&Destination::queue("orders.eu")).unwrap();
        assert!(exchange.is_bound(key));

        router.dispatch_tick(now);
        assert_eq!(drain_bodies(&mut router, 1, now), vec!["hello"]);
    }

    #[test]
    fn test_literal_subscribe_creates_exchange() {
        let now = Instant::now();
        let mut router = Router::default();
        let key = router.subscribe(sub(1, "s1", "topic/news", AckMode::Auto), now).unwrap();

        let exchange = router.exchange(&Destination::topic("news")).unwrap();
        assert_eq!(exchange.binding_count(), 1);
        assert!(exchange.is_bound(key));
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let now = Instant::now();
        let mut router = Router::default();
        router.subscribe(sub(1, "s1", "queue/a", AckMode::Auto), now).unwrap();

        let err = router.subscribe(sub(1, "s1", "queue/b", AckMode::Auto), now).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateSubscription { .. }));
        // Same id on another peer is fine.
        assert!(router.subscribe(sub(2, "s1", "queue/a", AckMode::Auto), now).is_ok());
        assert_eq!(router.subscription_count(), 2);
    }

    #[test]
    fn test_queue_and_topic_end_to_end() {
        let now = Instant::now();
        let mut router = Router::default();
        router.subscribe(sub(1, "q", "queue/jobs", AckMode::Auto), now).unwrap();
        router.subscribe(sub(2, "q", "queue/jobs", AckMode::Auto), now).unwrap();
        router.subscribe(sub(1, "t", "topic/events", AckMode::Auto), now).unwrap();
        router.subscribe(sub(2, "t", "topic/events", AckMode::Auto), now).unwrap();

        for body in ["j1", "j2"] {
            router.post(Message::new(Destination::queue("jobs"), body), now);
        }
        router.post(Message::new(Destination::topic("events"), "e1"), now);
        router.dispatch_tick(now);

        let mut peer1 = drain_bodies(&mut router, 1, now);
        let mut peer2 = drain_bodies(&mut router, 2, now);
        peer1.sort();
        peer2.sort();
        assert_eq!(peer1, vec!["e1", "j1"]);
        assert_eq!(peer2, vec!["e1", "j2"]);
    }

    #[test]
    fn test_ack_and_nack_errors() {
        let now = Instant::now();
        let mut router = Router::default();
        router.subscribe(sub(1, "s1", "queue/a", AckMode::Client), now).unwrap();
        router.post(Message::new(Destination::queue("a"), "x"), now);
        router.dispatch_tick(now);
        let frames = router.deliveries(PeerId(1), 10, now);
        let id = frames[0].header("message-id").unwrap().to_string();

        assert!(matches!(
            router.ack(PeerId(1), "nope", &id),
            Err(CoreError::SubscriptionNotFound { .. })
        ));
        assert!(matches!(
            router.ack(PeerId(1), "s1", "unknown"),
            Err(CoreError::MessageNotFound { .. })
        ));
        assert!(matches!(
            router.ack(PeerId(2), "s1", &id),
            Err(CoreError::SubscriptionNotFound { .. })
        ));
        assert_eq!(router.ack(PeerId(1), "s1", &id).unwrap(), 1);
        assert!(router.nack(PeerId(1), "s1", &id).is_err());
    }

    #[test]
    fn test_unsubscribe_recovers_for_other_consumers() {
        let now = Instant::now();
        let mut router = Router::default();
        let first = router.subscribe(sub(1, "s", "queue/a", AckMode::Client), now).unwrap();
        router.post(Message::new(Destination::queue("a"), "x"), now);
        router.dispatch_tick(now);
        assert_eq!(router.deliveries(PeerId(1), 10, now).len(), 1);

        assert_eq!(router.unsubscribe(first), Some(1));
        assert_eq!(router.unsubscribe(first), None);
        assert!(router.find_subscription(PeerId(1), "s").is_none());

        router.subscribe(sub(2, "s", "queue/a", AckMode::Client), now).unwrap();
        router.dispatch_tick(now);
        assert_eq!(drain_bodies(&mut router, 2, now), vec!["x"]);
    }

    #[test]
    fn test_unsubscribe_id_and_peer() {
        let now = Instant::now();
        let mut router = Router::default();
        router.subscribe(sub(1, "a", "queue/a", AckMode::Auto), now).unwrap();
        router.subscribe(sub(1, "b", "topic/*", AckMode::Auto), now).unwrap();
        router.subscribe(sub(2, "a", "queue/a", AckMode::Auto), now).unwrap();

        assert!(matches!(
            router.unsubscribe_id(PeerId(1), "zzz"),
            Err(CoreError::SubscriptionNotFound { .. })
        ));
        assert!(router.unsubscribe_id(PeerId(1), "a").is_ok());
        assert_eq!(router.unsubscribe_peer(PeerId(1)), 1);
        assert_eq!(router.subscription_count(), 1);
        assert!(router.peer_subscriptions(PeerId(1)).is_empty());
    }

    #[test]
    fn test_nack_redelivers() {
        let now = Instant::now();
        let config = RouterConfig {
            queue: ExchangeConfig {
                recover_dead_interval: std::time::Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut router = Router::new(config);
        router.subscribe(sub(1, "s", "queue/a", AckMode::ClientIndividual), now).unwrap();
        router.post(Message::new(Destination::queue("a"), "x"), now);
        router.dispatch_tick(now);
        let frames = router.deliveries(PeerId(1), 10, now);
        let id = frames[0].header("message-id").unwrap().to_string();

        assert_eq!(router.nack(PeerId(1), "s", &id).unwrap(), 1);
        router.dispatch_tick(now);
        let again = router.deliveries(PeerId(1), 10, now);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].header("message-id"), Some(id.as_str()));
    }

    #[test]
    fn test_dead_recovery_stays_in_own_exchange() {
        let now = Instant::now();
        let config = RouterConfig {
            queue: ExchangeConfig {
                recover_dead_interval: std::time::Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut router = Router::new(config);
        router.subscribe(sub(1, "x", "queue/a", AckMode::ClientIndividual), now).unwrap();
        let wildcard =
            router.subscribe(sub(2, "w", "queue/*", AckMode::ClientIndividual), now).unwrap();

        router.post(Message::new(Destination::queue("b"), "b1"), now);
        router.post(Message::new(Destination::queue("c"), "c1"), now);
        router.dispatch_tick(now);
        let frames = router.deliveries(PeerId(2), 10, now);
        assert_eq!(frames.len(), 2);
        let b1 = frames
            .iter()
            .find(|f| &f.body()[..] == b"b1")
            .and_then(|f| f.header("message-id"))
            .unwrap()
            .to_string();

        assert_eq!(router.nack(PeerId(2), "w", &b1).unwrap(), 1);
        router.dispatch_tick(now);
        assert_eq!(router.exchange(&Destination::queue("a")).unwrap().send_queue_len(), 0);

        router.unsubscribe(wildcard).unwrap();
        router.subscribe(sub(3, "b", "queue/b", AckMode::Auto), now).unwrap();
        router.dispatch_tick(now);

        assert_eq!(drain_bodies(&mut router, 3, now), vec!["b1"]);
        assert!(drain_bodies(&mut router, 1, now).is_empty());
    }

    #[test]
    fn test_topic_unsubscribe_does_not_duplicate() {
        let now = Instant::now();
        let mut router = Router::default();
        let first = router.subscribe(sub(1, "a", "topic/t", AckMode::Auto), now).unwrap();
        router.subscribe(sub(2, "b", "topic/t", AckMode::Auto), now).unwrap();

        router.post(Message::new(Destination::topic("t"), "once"), now);
        router.dispatch_tick(now);
        assert_eq!(router.unsubscribe(first), Some(0));
        router.dispatch_tick(now);

        assert_eq!(drain_bodies(&mut router, 2, now), vec!["once"]);
    }

    #[test]
    fn test_dispatch_reports_telemetry() {
        let now = Instant::now();
        let telemetry = Arc::new(RecordingTelemetry::default());
        let mut router = Router::default().with_telemetry(telemetry.clone());
        router.post(Message::new(Destination::topic("t"), "x"), now);
        router.dispatch_tick(now);

        let counters = telemetry.counters.lock();
        assert!(counters.contains(&(Counter::MessagesPosted, "topic/t".to_string(), 1)));
        assert!(counters.contains(&(Counter::MessagesDropped, "topic/t".to_string(), 1)));
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let now = Instant::now();
        let mut router = Router::default();
        router.subscribe(sub(1, "a", "queue/a", AckMode::Auto), now).unwrap();
        router.post(Message::new(Destination::queue("b"), "x"), now);

        assert_eq!(router.shutdown(), 1);
        assert_eq!(router.subscription_count(), 0);
        assert_eq!(router.exchange_count(), 0);
    }
}
