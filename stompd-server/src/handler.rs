//! Command handlers.
//!
//! Maps decoded frames onto router operations and writes the replies.

use crate::config::Config;
use crate::error::ServerError;
use crate::session::Session;
use std::time::{Duration, Instant};
use stompd_core::{AckMode, Destination, DestinationKind, Message, Router, Subscription};
use stompd_protocol::header;
use stompd_protocol::{Command, Frame, HeartBeatPolicy, Negotiated, PROTOCOL_VERSION};
use tracing::{debug, info};

/// Identity advertised in CONNECTED frames.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    /// Value of the `server` header.
    pub fn header_value(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "stompd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Command handler.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    info: ServerInfo,
    heartbeat: HeartBeatPolicy,
    /// Inactivity timeout applied to queue messages (zero = never).
    queue_message_expire: Duration,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(heartbeat: HeartBeatPolicy, queue_message_expire: Duration) -> Self {
        Self {
            info: ServerInfo::default(),
            heartbeat,
            queue_message_expire,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.heartbeat.policy(),
            config.broker.queue_message_expire(),
        )
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Handles one frame, writing replies and errors to the session.
    pub fn handle(&self, session: &mut Session, router: &mut Router, frame: Frame, now: Instant) {
        if !session.is_authenticated() && !is_connect(frame.kind()) {
            session.send_error(&ServerError::NotConnected, now);
            return;
        }

        if self.intercept_transaction(session, &frame, now) {
            return;
        }

        debug!(
            session_id = %session.id,
            command = %frame.command(),
            "Handling frame"
        );

        let result = match frame.kind() {
            Command::Connect | Command::Stomp => self.handle_connect(session, &frame, now),
            Command::Send => self.handle_send(session, router, &frame, now),
            Command::Subscribe => self.handle_subscribe(session, router, &frame, now),
            Command::Unsubscribe => self.handle_unsubscribe(session, router, &frame),
            Command::Ack => self.handle_ack(session, router, &frame),
            Command::Nack => self.handle_nack(session, router, &frame),
            Command::Begin => self.handle_begin(session, &frame),
            Command::Commit => self.handle_commit(session, router, &frame, now),
            Command::Abort => self.handle_abort(session, &frame),
            Command::Disconnect => self.handle_disconnect(session),
            _ => Err(ServerError::UnknownCommand(frame.command().to_string())),
        };

        if let Err(e) = result {
            session.send_error(&e, now);
            return;
        }

        if !is_connect(frame.kind()) {
            if let Some(receipt) = frame.header(header::RECEIPT) {
                session.send_frame(&Frame::receipt(receipt), now);
            }
        }
        if let Some(receipt_id) = frame.header(header::RECEIPT_ID) {
            session.send_frame(&Frame::receipt(receipt_id), now);
        }
    }

    /// Buffers SEND/ACK/NACK frames that name a transaction. Returns whether
    /// the frame was consumed.
    fn intercept_transaction(&self, session: &mut Session, frame: &Frame, now: Instant) -> bool {
        if !frame.kind().is_transactable() || frame.in_transaction() {
            return false;
        }
        let Some(transaction) = frame.header(header::TRANSACTION) else {
            return false;
        };

        if let Err(e) = session
            .transactions_mut()
            .store(transaction, frame.clone())
        {
            session.send_error(&ServerError::from(e), now);
        }
        true
    }

    // =========================================================================
    // Connection
    // =========================================================================

    fn handle_connect(
        &self,
        session: &mut Session,
        frame: &Frame,
        now: Instant,
    ) -> Result<(), ServerError> {
        let login = frame.header(header::LOGIN).ok_or(ServerError::MissingLogin)?;
        if frame.header(header::PASSCODE).is_none() {
            return Err(ServerError::MissingPasscode);
        }
        if login.is_empty() {
            return Err(ServerError::EmptyLogin);
        }

        let negotiated = match frame.header(header::HEART_BEAT) {
            Some(value) => self.heartbeat.negotiate(value)?,
            None => Negotiated::default(),
        };

        session.authenticate(login);
        session.enable_heart_beat(negotiated, self.heartbeat.timeout_factor, now);

        info!(
            session_id = %session.id,
            login,
            remote_addr = %session.remote_addr,
            heart_beat = %negotiated.header_value(),
            "Authenticated"
        );

        let connected = Frame::from_command(Command::Connected)
            .with_header(header::VERSION, PROTOCOL_VERSION)
            .with_header(header::SESSION, session.id.as_str())
            .with_header(header::SERVER, self.info.header_value())
            .with_header(header::HEART_BEAT, negotiated.header_value());
        session.send_frame(&connected, now);
        Ok(())
    }

    fn handle_disconnect(&self, session: &mut Session) -> Result<(), ServerError> {
        info!(session_id = %session.id, "Peer requested disconnect");
        session.request_disconnect();
        Ok(())
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    fn handle_send(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
        now: Instant,
    ) -> Result<(), ServerError> {
        let destination = frame
            .header(header::DESTINATION)
            .ok_or_else(|| ServerError::missing_header(Command::Send, header::DESTINATION))?;
        let destination = Destination::parse(destination)?;

        let mut message = Message::new(destination.clone(), frame.body().clone());
        if destination.kind() == DestinationKind::Queue {
            message = message.with_inactivity_timeout(self.queue_message_expire);
        }
        if let Some(transaction) = frame.header(header::TRANSACTION) {
            message = message.with_transaction(transaction);
        }
        message.copy_headers_from(frame.headers());

        debug!(
            session_id = %session.id,
            destination = %destination,
            message_id = %message.id(),
            transaction = message.transaction().unwrap_or(""),
            bytes = message.body_len(),
            "Posting message"
        );
        router.post(message, now);
        Ok(())
    }

    fn handle_subscribe(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
        now: Instant,
    ) -> Result<(), ServerError> {
        let destination = frame
            .header(header::DESTINATION)
            .ok_or_else(|| ServerError::missing_header(Command::Subscribe, header::DESTINATION))?;
        let id = frame
            .header(header::ID)
            .ok_or_else(|| ServerError::missing_header(Command::Subscribe, header::ID))?;

        let ack_mode = match frame.header(header::ACK) {
            Some(value) => value.parse::<AckMode>()?,
            None => AckMode::default(),
        };

        let prefetch = match frame
            .header(header::PREFETCH)
            .or_else(|| frame.header(header::PREFETCH_SHORT))
        {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| ServerError::InvalidPrefetch(value.to_string()))?,
            None => 0,
        };

        let pattern = Destination::parse(destination)?;
        if id.is_empty() {
            return Err(ServerError::InvalidSubscriptionId);
        }

        let subscription =
            Subscription::new(session.peer(), id, pattern, ack_mode).with_prefetch(prefetch);
        router.subscribe(subscription, now)?;
        Ok(())
    }

    fn handle_unsubscribe(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
    ) -> Result<(), ServerError> {
        let id = frame
            .header(header::ID)
            .ok_or_else(|| ServerError::missing_header(Command::Unsubscribe, header::ID))?;
        router.unsubscribe_id(session.peer(), id)?;
        Ok(())
    }

    fn handle_ack(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
    ) -> Result<(), ServerError> {
        let (subscription, message_id) = ack_headers(Command::Ack, frame)?;
        router.ack(session.peer(), subscription, message_id)?;
        Ok(())
    }

    fn handle_nack(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
    ) -> Result<(), ServerError> {
        let (subscription, message_id) = ack_headers(Command::Nack, frame)?;
        router.nack(session.peer(), subscription, message_id)?;
        Ok(())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn handle_begin(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let transaction = transaction_header(Command::Begin, frame)?;
        session.transactions_mut().begin(transaction);
        Ok(())
    }

    /// Replays the buffered frames in submission order.
    fn handle_commit(
        &self,
        session: &mut Session,
        router: &mut Router,
        frame: &Frame,
        now: Instant,
    ) -> Result<(), ServerError> {
        let transaction = transaction_header(Command::Commit, frame)?;
        let frames = session.transactions_mut().commit(transaction)?;
        debug!(
            session_id = %session.id,
            transaction,
            frames = frames.len(),
            "Committing transaction"
        );
        for buffered in frames {
            self.handle(session, router, buffered, now);
        }
        Ok(())
    }

    fn handle_abort(&self, session: &mut Session, frame: &Frame) -> Result<(), ServerError> {
        let transaction = transaction_header(Command::Abort, frame)?;
        let discarded = session.transactions_mut().abort(transaction)?;
        debug!(session_id = %session.id, transaction, discarded, "Aborted transaction");
        Ok(())
    }
}

fn is_connect(command: Command) -> bool {
    matches!(command, Command::Connect | Command::Stomp)
}

fn ack_headers(command: Command, frame: &Frame) -> Result<(&str, &str), ServerError> {
    let message_id = frame
        .header(header::MESSAGE_ID)
        .ok_or_else(|| ServerError::missing_header(command, header::MESSAGE_ID))?;
    let subscription = frame
        .header(header::SUBSCRIPTION)
        .ok_or_else(|| ServerError::missing_header(command, header::SUBSCRIPTION))?;
    Ok((subscription, message_id))
}

fn transaction_header(command: Command, frame: &Frame) -> Result<&str, ServerError> {
    frame
        .header(header::TRANSACTION)
        .ok_or_else(|| ServerError::missing_header(command, header::TRANSACTION))
}
