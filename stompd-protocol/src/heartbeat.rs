//! Heart-beat negotiation and liveness timing.
//!
//! A client advertises `heart-beat:<cx>,<cy>`: it can send a beat every `cx`
//! milliseconds and wants one every `cy` milliseconds. The server clamps both
//! to its minimums and answers with its own pair in the opposite order.

use crate::error::ProtocolError;
use std::time::{Duration, Instant};

/// What gets written to the wire for a single heart-beat.
pub const HEARTBEAT_BYTES: &[u8] = b"\n";

/// Server-side limits applied during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeatPolicy {
    /// Lower bound on how often the client must beat.
    pub min_expect: Duration,
    /// Lower bound on how often the server beats.
    pub min_send: Duration,
    /// Missed intervals tolerated before the peer is considered dead.
    pub timeout_factor: u32,
}

impl Default for HeartBeatPolicy {
    fn default() -> Self {
        Self {
            min_expect: Duration::from_millis(5000),
            min_send: Duration::from_millis(1000),
            timeout_factor: 3,
        }
    }
}

impl HeartBeatPolicy {
    /// Negotiates intervals from the client's `heart-beat` header value.
    pub fn negotiate(&self, value: &str) -> Result<Negotiated, ProtocolError> {
        let invalid = || ProtocolError::InvalidHeartBeat(value.to_string());

        let mut fields = value.split(',');
        let (Some(supports), Some(wants), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid());
        };
        let supports: u64 = supports.trim().parse().map_err(|_| invalid())?;
        let wants: u64 = wants.trim().parse().map_err(|_| invalid())?;

        let expects = match supports {
            0 => Duration::ZERO,
            ms => Duration::from_millis(ms).max(self.min_expect),
        };
        let will_send = match wants {
            0 => Duration::ZERO,
            ms => Duration::from_millis(ms).max(self.min_send),
        };

        Ok(Negotiated { will_send, expects })
    }
}

/// Agreed heart-beat intervals. A zero duration disables that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Negotiated {
    /// How often the server sends a beat.
    pub will_send: Duration,
    /// How often the server expects to hear from the client.
    pub expects: Duration,
}

impl Negotiated {
    /// Value for the `heart-beat` header of the CONNECTED reply.
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.will_send.as_millis(),
            self.expects.as_millis()
        )
    }

    pub fn is_enabled(&self) -> bool {
        !self.will_send.is_zero() || !self.expects.is_zero()
    }
}

/// Tracks when beats were last sent and received for one connection.
#[derive(Debug, Clone)]
pub struct HeartBeat {
    negotiated: Negotiated,
    timeout_factor: u32,
    last_sent: Instant,
    last_received: Instant,
}

impl HeartBeat {
    pub fn new(negotiated: Negotiated, timeout_factor: u32, now: Instant) -> Self {
        Self {
            negotiated,
            timeout_factor,
            last_sent: now,
            last_received: now,
        }
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    /// Returns whether the outbound side has been idle long enough to beat.
    pub fn is_send_due(&self, now: Instant) -> bool {
        !self.negotiated.will_send.is_zero()
            && now.saturating_duration_since(self.last_sent) >= self.negotiated.will_send
    }

    /// Returns whether nothing has arrived for `timeout_factor` intervals.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        !self.negotiated.expects.is_zero()
            && now.saturating_duration_since(self.last_received)
                > self.negotiated.expects * self.timeout_factor
    }

    /// Records outbound traffic of any kind.
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records inbound traffic of any kind.
    pub fn record_received(&mut self, at: Instant) {
        if at > self.last_received {
            self.last_received = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_clamps_to_minimums() {
        let policy = HeartBeatPolicy::default();
        let negotiated = policy.negotiate("2000,3000").unwrap();

        assert_eq!(negotiated.expects, Duration::from_millis(5000));
        assert_eq!(negotiated.will_send, Duration::from_millis(3000));
        assert_eq!(negotiated.header_value(), "3000,5000");
    }

    #[test]
    fn test_negotiate_zero_disables() {
        let policy = HeartBeatPolicy::default();
        let negotiated = policy.negotiate("0,0").unwrap();
        assert!(!negotiated.is_enabled());
        assert_eq!(negotiated.header_value(), "0,0");

        let negotiated = policy.negotiate("10000,0").unwrap();
        assert_eq!(negotiated.expects, Duration::from_millis(10000));
        assert!(negotiated.will_send.is_zero());
        assert_eq!(negotiated.header_value(), "0,10000");

        let negotiated = policy.negotiate("0,500").unwrap();
        assert_eq!(negotiated.header_value(), "1000,0");
    }

    #[test]
    fn test_negotiate_rejects_bad_values() {
        let policy = HeartBeatPolicy::default();
        assert!(policy.negotiate("").is_err());
        assert!(policy.negotiate("1000").is_err());
        assert!(policy.negotiate("1,2,3").is_err());
        assert!(policy.negotiate("a,b").is_err());
        assert!(policy.negotiate(" 100 , 200 ").is_ok());
    }

    #[test]
    fn test_send_due() {
        let start = Instant::now();
        let negotiated = Negotiated {
            will_send: Duration::from_millis(1000),
            expects: Duration::ZERO,
        };
        let mut beat = HeartBeat::new(negotiated, 3, start);

        assert!(!beat.is_send_due(start + Duration::from_millis(999)));
        assert!(beat.is_send_due(start + Duration::from_millis(1000)));

        beat.record_sent(start + Duration::from_millis(1000));
        assert!(!beat.is_send_due(start + Duration::from_millis(1500)));
        assert!(!beat.is_timed_out(start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_timeout_after_three_intervals() {
        let start = Instant::now();
        let negotiated = Negotiated {
            will_send: Duration::ZERO,
            expects: Duration::from_millis(5000),
        };
        let mut beat = HeartBeat::new(negotiated, 3, start);

        assert!(!beat.is_timed_out(start + Duration::from_millis(15000)));
        assert!(beat.is_timed_out(start + Duration::from_millis(15001)));

        beat.record_received(start + Duration::from_millis(14000));
        assert!(!beat.is_timed_out(start + Duration::from_millis(20000)));
        assert!(!beat.is_send_due(start + Duration::from_secs(3600)));
    }
}
