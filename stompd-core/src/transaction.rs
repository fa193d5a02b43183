//! Client transactions.
//!
//! SEND, ACK and NACK frames carrying a `transaction` header are held here
//! until the client commits or aborts.

use crate::error::CoreError;
use std::collections::HashMap;
use stompd_protocol::Frame;

/// Frames buffered under one transaction id, in submission order.
#[derive(Debug)]
pub struct Transaction {
    id: String,
    frames: Vec<Frame>,
}

impl Transaction {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frames: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Marks the frame transactional and appends it.
    pub fn store(&mut self, mut frame: Frame) {
        frame.mark_in_transaction();
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Consumes the transaction, yielding its frames in submission order.
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

/// Open transactions for one session.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    transactions: HashMap<String, Transaction>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a transaction. Beginning an id that is already open keeps the
    /// existing buffer.
    pub fn begin(&mut self, id: &str) -> &mut Transaction {
        self.transactions
            .entry(id.to_string())
            .or_insert_with(|| Transaction::new(id))
    }

    pub fn store(&mut self, id: &str, frame: Frame) -> Result<(), CoreError> {
        self.get_mut(id)?.store(frame);
        Ok(())
    }

    /// Closes the transaction and returns its frames for replay, oldest first.
    pub fn commit(&mut self, id: &str) -> Result<Vec<Frame>, CoreError> {
        self.transactions
            .remove(id)
            .map(Transaction::into_frames)
            .ok_or_else(|| not_found(id))
    }

    /// Closes the transaction, discarding its frames. Returns how many were
    /// dropped.
    pub fn abort(&mut self, id: &str) -> Result<usize, CoreError> {
        self.transactions
            .remove(id)
            .map(|t| t.len())
            .ok_or_else(|| not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Drops every open transaction.
    pub fn clear(&mut self) -> usize {
        let count = self.transactions.len();
        self.transactions.clear();
        count
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Transaction, CoreError> {
        self.transactions.get_mut(id).ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &str) -> CoreError {
    CoreError::TransactionNotFound {
        transaction: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stompd_protocol::Command;

    fn send(body: &'static str) -> Frame {
        Frame::from_command(Command::Send)
            .with_header("transaction", "tx")
            .with_body(body)
    }

    #[test]
    fn test_commit_replays_in_submission_order() {
        let mut buffer = TransactionBuffer::new();
        buffer.begin("tx");
        buffer.store("tx", send("A")).unwrap();
        buffer.store("tx", send("B")).unwrap();
        buffer.store("tx", send("C")).unwrap();

        let frames = buffer.commit("tx").unwrap();
        let bodies: Vec<&[u8]> = frames.iter().map(|f| &f.body()[..]).collect();
        assert_eq!(bodies, vec![&b"A"[..], &b"B"[..], &b"C"[..]]);
        assert!(frames.iter().all(|f| f.in_transaction()));
        assert!(!buffer.contains("tx"));
    }

    #[test]
    fn test_abort_discards() {
        let mut buffer = TransactionBuffer::new();
        buffer.begin("tx");
        buffer.store("tx", send("A")).unwrap();
        assert_eq!(buffer.abort("tx").unwrap(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.commit("tx").is_err());
    }

    #[test]
    fn test_unknown_transaction() {
        let mut buffer = TransactionBuffer::new();
        assert!(matches!(
            buffer.store("missing", send("A")),
            Err(CoreError::TransactionNotFound { .. })
        ));
        assert!(buffer.abort("missing").is_err());
    }

    #[test]
    fn test_begin_is_idempotent() {
        let mut buffer = TransactionBuffer::new();
        buffer.begin("tx");
        buffer.store("tx", send("A")).unwrap();
        assert_eq!(buffer.begin("tx").len(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.clear(), 1);
    }
}
