//! Counter and gauge reporting.
//!
//! The engine reports through [`Telemetry`] and never reads anything back,
//! so a collector can be swapped without touching routing code.

use std::fmt;

/// Monotonic counters emitted by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    FramesIn,
    FramesOut,
    BytesIn,
    BytesOut,
    MessagesPosted,
    MessagesDispatched,
    MessagesDeferred,
    MessagesExpired,
    MessagesDropped,
    DeadRecovered,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::FramesIn => "frames_in",
            Counter::FramesOut => "frames_out",
            Counter::BytesIn => "bytes_in",
            Counter::BytesOut => "bytes_out",
            Counter::MessagesPosted => "messages_posted",
            Counter::MessagesDispatched => "messages_dispatched",
            Counter::MessagesDeferred => "messages_deferred",
            Counter::MessagesExpired => "messages_expired",
            Counter::MessagesDropped => "messages_dropped",
            Counter::DeadRecovered => "dead_recovered",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    SendQueueDepth,
    SendQueueBytes,
    Peers,
    Exchanges,
    Subscriptions,
}

impl Gauge {
    pub fn name(&self) -> &'static str {
        match self {
            Gauge::SendQueueDepth => "send_queue_depth",
            Gauge::SendQueueBytes => "send_queue_bytes",
            Gauge::Peers => "peers",
            Gauge::Exchanges => "exchanges",
            Gauge::Subscriptions => "subscriptions",
        }
    }
}

impl fmt::Display for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sink for broker statistics. `scope` names the exchange or peer the value
/// belongs to, or is empty for broker-wide values.
pub trait Telemetry: Send + Sync {
    fn incr(&self, counter: Counter, scope: &str, value: u64);

    fn gauge(&self, gauge: Gauge, scope: &str, value: f64);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn incr(&self, _counter: Counter, _scope: &str, _value: u64) {}

    fn gauge(&self, _gauge: Gauge, _scope: &str, _value: f64) {}
}
