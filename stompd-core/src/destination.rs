//! Destination names and pattern matching.
//!
//! A destination is written `<type>/<key>` where the type is `queue` or
//! `topic`. A leading `/` is tolerated. Subscriptions hold a destination
//! whose key may contain glob wildcards: `*` matches any run of characters
//! and `?` matches exactly one.

use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;

/// Destination type segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    /// Competing consumers; each message goes to one subscriber.
    Queue,
    /// Broadcast; each message goes to every subscriber.
    Topic,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<type>/<key>` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    kind: DestinationKind,
    key: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    pub fn queue(key: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, key)
    }

    pub fn topic(key: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, key)
    }

    /// Parses a destination header value.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let trimmed = value.trim().trim_start_matches('/');
        let Some((kind, key)) = trimmed.split_once('/') else {
            return Err(CoreError::InvalidDestination {
                destination: value.to_string(),
            });
        };
        if kind.is_empty() || key.trim_matches('/').is_empty() {
            return Err(CoreError::InvalidDestination {
                destination: value.to_string(),
            });
        }

        let kind = match kind {
            "queue" => DestinationKind::Queue,
            "topic" => DestinationKind::Topic,
            _ => {
                return Err(CoreError::UnknownDestinationType {
                    destination: value.to_string(),
                })
            }
        };
        Ok(Self::new(kind, key))
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    /// The part after the type segment.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Treats `self` as a pattern and tests it against a concrete destination.
    ///
    /// Kinds must agree; keys are compared with [`glob_match`].
    pub fn matches(&self, destination: &Destination) -> bool {
        self.kind == destination.kind && glob_match(&self.key, &destination.key)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

impl FromStr for Destination {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Glob match supporting `*` (any run, including empty) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, absorbed)) = backtrack {
            p = star + 1;
            t = absorbed + 1;
            backtrack = Some((star, absorbed + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        let dest = Destination::parse("queue/orders").unwrap();
        assert_eq!(dest.kind(), DestinationKind::Queue);
        assert_eq!(dest.key(), "orders");

        let dest = Destination::parse("/topic/prices/eu").unwrap();
        assert_eq!(dest.kind(), DestinationKind::Topic);
        assert_eq!(dest.key(), "prices/eu");
        assert_eq!(dest.to_string(), "topic/prices/eu");
    }

    #[test]
    fn test_parse_destination_errors() {
        assert!(matches!(
            Destination::parse("orders"),
            Err(CoreError::InvalidDestination { .. })
        ));
        assert!(matches!(
            Destination::parse("queue/"),
            Err(CoreError::InvalidDestination { .. })
        ));
        assert!(matches!(
            Destination::parse("exchange/orders"),
            Err(CoreError::UnknownDestinationType { .. })
        ));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("orders", "orders"));
        assert!(!glob_match("orders", "orders2"));
        assert!(glob_match("orders*", "orders2"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything/at/all"));
        assert!(glob_match("prices/*/eur", "prices/fx/eur"));
        assert!(!glob_match("prices/*/eur", "prices/fx/usd"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*a*b", "xxaxxb"));
        assert!(!glob_match("*a*b", "xxaxxbx"));
        assert!(glob_match("**", "x"));
    }

    #[test]
    fn test_pattern_kind_must_agree() {
        let pattern = Destination::parse("queue/*").unwrap();
        assert!(pattern.matches(&Destination::queue("orders")));
        assert!(!pattern.matches(&Destination::topic("orders")));
    }

    mod props {
        use crate::destination::glob_match;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_literal_matches_itself(key in "[a-z0-9./]{0,24}") {
                prop_assert!(glob_match(&key, &key));
                let star = format!("{}*", key);
                let with_tail = format!("{}tail", key);
                prop_assert!(glob_match(&star, &with_tail));
            }

            #[test]
            fn prop_star_matches_anything(text in "\\PC{0,32}") {
                prop_assert!(glob_match("*", &text));
            }
        }
    }
}
