//! Frame headers.
//!
//! Header names are compared case-insensitively. A [`Headers`] list keeps
//! insertion order and never holds two entries with the same name: when a
//! frame arrives with repeated headers the first occurrence wins.

use std::fmt;

pub const ACCEPT_VERSION: &str = "accept-version";
pub const ACK: &str = "ack";
pub const CODE: &str = "code";
pub const CONTENT_LENGTH: &str = "content-length";
pub const DESTINATION: &str = "destination";
pub const HEART_BEAT: &str = "heart-beat";
pub const ID: &str = "id";
pub const LOGIN: &str = "login";
pub const MESSAGE: &str = "message";
pub const MESSAGE_ID: &str = "message-id";
pub const PASSCODE: &str = "passcode";
pub const PREFETCH: &str = "openstomp.prefetch";
pub const PREFETCH_SHORT: &str = "prefetch";
pub const RECEIPT: &str = "receipt";
pub const RECEIPT_ID: &str = "receipt-id";
pub const SERVER: &str = "server";
pub const SESSION: &str = "session";
pub const SUBSCRIPTION: &str = "subscription";
pub const TRANSACTION: &str = "transaction";
pub const VERSION: &str = "version";

/// A single `name:value` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parses a header line (without its line terminator).
    ///
    /// The value is everything after the first `:`, trimmed of surrounding
    /// whitespace. Returns `None` when the line has no `:` or an empty name.
    pub fn parse(line: &str) -> Option<Self> {
        let (name, value) = line.split_once(':')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim()))
    }

    /// Returns whether this header has the given name (case-insensitive).
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Ordered, case-insensitively unique header list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header unless one with the same name is already present.
    ///
    /// Returns `false` when the header was discarded as a duplicate.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.push(Header::new(name, value))
    }

    /// Adds a parsed header with first-occurrence-wins semantics.
    pub fn push(&mut self, header: Header) -> bool {
        if self.contains(&header.name) {
            return false;
        }
        self.entries.push(header);
        true
    }

    /// Sets a header, replacing any existing value in place.
    pub fn replace(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let header = Header::new(name, value);
        match self.entries.iter_mut().find(|h| h.is(&header.name)) {
            Some(existing) => *existing = header,
            None => self.entries.push(header),
        }
    }

    /// Removes a header, returning its value if it was present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|h| h.is(name))?;
        Some(self.entries.remove(pos).value)
    }

    /// Copies every header from `other`, overwriting same-named entries.
    pub fn copy_from(&mut self, other: &Headers) {
        for header in other.iter() {
            self.replace(header.name.clone(), header.value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.is(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.is(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_line() {
        let header = Header::parse("destination:/queue/a").unwrap();
        assert_eq!(header.name, "destination");
        assert_eq!(header.value, "/queue/a");

        // Everything after the first colon belongs to the value
        let header = Header::parse("url: http://host:80/x ").unwrap();
        assert_eq!(header.value, "http://host:80/x");

        let header = Header::parse("empty:").unwrap();
        assert_eq!(header.value, "");

        assert!(Header::parse("no colon here").is_none());
        assert!(Header::parse(":value").is_none());
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut headers = Headers::new();
        assert!(headers.add("id", "1"));
        assert!(!headers.add("ID", "2"));
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Id"), Some("1"));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut headers = Headers::new();
        headers.add("a", "1");
        headers.add("b", "2");
        headers.replace("A", "3");

        let names: Vec<_> = headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["A", "b"]);
        assert_eq!(headers.get("a"), Some("3"));
    }

    #[test]
    fn test_remove_and_copy() {
        let mut headers = Headers::new();
        headers.add("receipt", "r-1");
        headers.add("destination", "queue/a");
        assert_eq!(headers.remove("RECEIPT"), Some("r-1".to_string()));
        assert!(headers.remove("receipt").is_none());

        let mut other = Headers::new();
        other.add("destination", "queue/b");
        other.add("x-custom", "yes");
        headers.copy_from(&other);

        assert_eq!(headers.get(DESTINATION), Some("queue/b"));
        assert_eq!(headers.get("x-custom"), Some("yes"));
        assert_eq!(headers.len(), 2);
    }
}
