//! Tick-driven scheduler.
//!
//! One [`Broker::run_once`] pass writes pending deliveries, answers due
//! heart-beats, feeds a bounded number of frames per peer to the command
//! handler and then runs one router dispatch tick. The broker is owned by a
//! single task; sockets only ever touch the [`PeerHandle`] buffers.

use crate::config::{BrokerConfig, Config};
use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::session::Session;
use crate::transport::PeerHandle;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use stompd_core::{Counter, Gauge, NoopTelemetry, PeerId, Router, Telemetry};
use tracing::{debug, info, warn};

/// Peer table plus routing state.
pub struct Broker {
    config: BrokerConfig,
    handler: CommandHandler,
    router: Router,
    sessions: BTreeMap<PeerId, Session>,
    next_peer: u64,
    telemetry: Arc<dyn Telemetry>,
}

impl Broker {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.broker.clone(),
            handler: CommandHandler::from_config(config),
            router: Router::new(config.broker.router_config()),
            sessions: BTreeMap::new(),
            next_peer: 1,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Reports broker and router statistics to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.router = std::mem::take(&mut self.router).with_telemetry(telemetry.clone());
        self.telemetry = telemetry;
        self
    }

    pub fn with_handler(mut self, handler: CommandHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn session(&self, peer: PeerId) -> Option<&Session> {
        self.sessions.get(&peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Registers a new connection and returns the handle its socket task
    /// reads into and flushes from.
    pub fn connect(&mut self, remote_addr: SocketAddr, now: Instant) -> (PeerId, Arc<PeerHandle>) {
        let peer = PeerId(self.next_peer);
        self.next_peer += 1;

        let handle = Arc::new(PeerHandle::new());
        let session = Session::new(peer, remote_addr, handle.clone(), now);
        info!(
            peer = %peer,
            session_id = %session.id,
            remote_addr = %remote_addr,
            "Peer connected"
        );
        self.sessions.insert(peer, session);
        self.telemetry
            .gauge(Gauge::Peers, "", self.sessions.len() as f64);
        (peer, handle)
    }

    /// Forgets a peer, returning its in-flight messages to their exchanges
    /// and dropping its open transactions.
    pub fn disconnect(&mut self, peer: PeerId) -> bool {
        let Some(mut session) = self.sessions.remove(&peer) else {
            return false;
        };
        let subscriptions = self.router.unsubscribe_peer(peer);
        let transactions = session.transactions_mut().clear();
        session.request_disconnect();

        info!(
            peer = %peer,
            session_id = %session.id,
            login = session.login().unwrap_or(""),
            subscriptions,
            transactions,
            "Peer disconnected"
        );
        self.telemetry
            .gauge(Gauge::Peers, "", self.sessions.len() as f64);
        true
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Runs one scheduler pass. Returns whether any work was done.
    pub fn run_once(&mut self, now: Instant) -> bool {
        let mut busy = false;

        for (peer, session) in self.sessions.iter_mut() {
            if session.wants_disconnect() {
                continue;
            }

            let delivered = self
                .router
                .deliveries(*peer, self.config.delivery_batch, now);
            busy |= !delivered.is_empty();
            for frame in &delivered {
                session.send_frame(frame, now);
            }

            session.try_heart_beat(now);

            for _ in 0..self.config.max_work {
                if session.wants_disconnect() {
                    break;
                }
                match session.next_frame() {
                    Some(Ok(frame)) => {
                        self.handler.handle(session, &mut self.router, frame, now);
                        busy = true;
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "Malformed frame");
                        session.send_error(&ServerError::Protocol(e), now);
                        busy = true;
                    }
                    None => break,
                }
            }

            if !session.wants_disconnect() && session.is_heart_beat_timeout(now) {
                warn!(
                    peer = %peer,
                    session_id = %session.id,
                    remote_addr = %session.remote_addr,
                    "Heart-beat timeout"
                );
                session.send_error(&ServerError::HeartBeatTimeout, now);
            }

            report_io(self.telemetry.as_ref(), &peer.to_string(), session);
        }

        let report = self.router.dispatch_tick(now);
        busy |= !report.is_idle();
        busy
    }

    /// Drops every subscription and closes every session.
    pub fn shutdown(&mut self) -> usize {
        for session in self.sessions.values_mut() {
            session.request_disconnect();
        }
        let peers = self.sessions.len();
        self.sessions.clear();
        let subscriptions = self.router.shutdown();
        info!(peers, subscriptions, "Broker shut down");
        self.telemetry.gauge(Gauge::Peers, "", 0.0);
        peers
    }
}

fn report_io(telemetry: &dyn Telemetry, scope: &str, session: &mut Session) {
    let io = session.take_io_stats();
    for (counter, value) in [
        (Counter::FramesIn, io.frames_in),
        (Counter::FramesOut, io.frames_out),
        (Counter::BytesIn, io.bytes_in),
        (Counter::BytesOut, io.bytes_out),
    ] {
        if value > 0 {
            telemetry.incr(counter, scope, value);
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.sessions.len())
            .field("exchanges", &self.router.exchange_count())
            .field("subscriptions", &self.router.subscription_count())
            .finish()
    }
}
