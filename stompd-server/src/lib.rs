//! # stompd-server
//!
//! TCP server for the stompd broker.
//!
//! This crate provides:
//! - Configuration loading (YAML file plus environment overrides)
//! - Per-connection sessions and the command handler
//! - The tick-driven broker scheduler
//! - Prometheus-backed telemetry
//! - A thin tokio TCP adapter

pub mod broker;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod session;
pub mod transport;

pub use broker::Broker;
pub use config::{BrokerConfig, Config, ConfigError, HeartBeatConfig, MetricsConfig, NetworkConfig};
pub use error::ServerError;
pub use handler::{CommandHandler, ServerInfo};
pub use metrics::Metrics;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{IoStats, Session, SessionState};
pub use transport::PeerHandle;
