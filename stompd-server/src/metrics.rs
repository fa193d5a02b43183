//! Prometheus metrics for the broker.
//!
//! [`Metrics`] implements the core [`Telemetry`] trait, so routing code
//! reports into a registry without knowing about prometheus.

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use stompd_core::telemetry;
use stompd_core::Telemetry;

const COUNTERS: [telemetry::Counter; 10] = [
    telemetry::Counter::FramesIn,
    telemetry::Counter::FramesOut,
    telemetry::Counter::BytesIn,
    telemetry::Counter::BytesOut,
    telemetry::Counter::MessagesPosted,
    telemetry::Counter::MessagesDispatched,
    telemetry::Counter::MessagesDeferred,
    telemetry::Counter::MessagesExpired,
    telemetry::Counter::MessagesDropped,
    telemetry::Counter::DeadRecovered,
];

const GAUGES: [telemetry::Gauge; 5] = [
    telemetry::Gauge::SendQueueDepth,
    telemetry::Gauge::SendQueueBytes,
    telemetry::Gauge::Peers,
    telemetry::Gauge::Exchanges,
    telemetry::Gauge::Subscriptions,
];

/// Prometheus metrics for the stompd server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently open connections.
    pub connections_active: Gauge,
    /// Connections refused at the connection limit.
    pub connections_rejected: Counter,
    counters: HashMap<telemetry::Counter, CounterVec>,
    gauges: HashMap<telemetry::Gauge, GaugeVec>,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "stompd_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "stompd_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let connections_rejected = Counter::with_opts(Opts::new(
            "stompd_connections_rejected_total",
            "Connections refused because max_connections was reached",
        ))?;
        registry.register(Box::new(connections_rejected.clone()))?;

        // Broker counters, labelled by exchange or peer
        let mut counters = HashMap::new();
        for counter in COUNTERS {
            let vec = CounterVec::new(
                Opts::new(
                    format!("stompd_{}_total", counter.name()),
                    format!("Total {} by scope", counter.name().replace('_', " ")),
                ),
                &["scope"],
            )?;
            registry.register(Box::new(vec.clone()))?;
            counters.insert(counter, vec);
        }

        let mut gauges = HashMap::new();
        for gauge in GAUGES {
            let vec = GaugeVec::new(
                Opts::new(
                    format!("stompd_{}", gauge.name()),
                    format!("Current {} by scope", gauge.name().replace('_', " ")),
                ),
                &["scope"],
            )?;
            registry.register(Box::new(vec.clone()))?;
            gauges.insert(gauge, vec);
        }

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_rejected,
            counters,
            gauges,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Telemetry for Metrics {
    fn incr(&self, counter: telemetry::Counter, scope: &str, value: u64) {
        if let Some(vec) = self.counters.get(&counter) {
            vec.with_label_values(&[scope]).inc_by(value as f64);
        }
    }

    fn gauge(&self, gauge: telemetry::Gauge, scope: &str, value: f64) {
        if let Some(vec) = self.gauges.get(&gauge) {
            vec.with_label_values(&[scope]).set(value);
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.counters.len())
            .field("gauges", &self.gauges.len())
            .finish()
    }
}
