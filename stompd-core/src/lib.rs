//! # stompd-core
//!
//! Routing engine for stompd.
//!
//! This crate provides:
//! - Destination parsing and glob pattern matching
//! - Messages and per-subscription delivery queues with ack modes and prefetch
//! - Exchanges with fanout and topic routing, expiry and dead-message recovery
//! - The router that owns exchanges and subscriptions
//! - Transaction buffering for SEND, ACK and NACK
//! - The telemetry interface the engine reports through

pub mod destination;
pub mod error;
pub mod exchange;
pub mod message;
pub mod router;
pub mod subscription;
pub mod telemetry;
pub mod transaction;

pub use destination::{glob_match, Destination, DestinationKind};
pub use error::CoreError;
pub use exchange::{
    DispatchReport, Exchange, ExchangeConfig, ExchangeStats, ExchangeType, RECOVER_DEAD_BATCH,
};
pub use message::Message;
pub use router::{Router, RouterConfig};
pub use subscription::{
    AckMode, PeerId, Subscription, SubscriptionKey, SubscriptionStats, SubscriptionTable,
};
pub use telemetry::{Counter, Gauge, NoopTelemetry, Telemetry};
pub use transaction::{Transaction, TransactionBuffer};
