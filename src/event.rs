//! Nostr event model and kind classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `a` – links to a replaceable event address (`kind:pubkey:d`)
/// - `d` – unique identifier for parameterized replaceable events
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value (second element), if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event accepted by the store.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "79be...",
///   "created_at": 1700000000,
///   "kind": 1,
///   "tags": [["e", "abc"], ["p", "def"]],
///   "content": "hello",
///   "sig": "deadbeef..."
/// }
/// ```
///
/// Decoding goes through [`crate::codec::RawEvent`] so that out-of-range kinds
/// and empty tags are reported with precise errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "crate::codec::RawEvent")]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u16,
    /// Ordered tag arrays.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Kind used by deletion requests.
pub const KIND_DELETION: u16 = 5;

/// Overwrite policy implied by an event's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Regular,
    /// Kinds 0, 3 and 10000..=19999; one event per (pubkey, kind).
    Replaceable,
    /// Kinds 30000..=39999; one event per (pubkey, kind, d).
    ParameterizedReplaceable,
    /// Kind 5.
    Deletion,
}

impl EventClass {
    pub fn of_kind(kind: u16) -> Self {
        match kind {
            KIND_DELETION => EventClass::Deletion,
            0 | 3 | 10000..=19999 => EventClass::Replaceable,
            30000..=39999 => EventClass::ParameterizedReplaceable,
            _ => EventClass::Regular,
        }
    }

    pub fn is_replaceable(self) -> bool {
        matches!(
            self,
            EventClass::Replaceable | EventClass::ParameterizedReplaceable
        )
    }
}

/// Identity used to resolve replaceable overwrites.
///
/// `d` is `None` for plain replaceable kinds and `Some` (possibly empty) for
/// parameterized ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplaceableKey {
    pub pubkey: String,
    pub kind: u16,
    pub d: Option<String>,
}

impl ReplaceableKey {
    /// Parse a NIP-01 address of the form `kind:pubkey:d`.
    ///
    /// Returns `None` when the address is malformed or its kind is not
    /// replaceable.
    pub fn from_address(address: &str) -> Option<Self> {
        let mut parts = address.splitn(3, ':');
        let kind: u16 = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?.to_string();
        let d = parts.next().unwrap_or_default().to_string();
        match EventClass::of_kind(kind) {
            EventClass::Replaceable => Some(Self {
                pubkey,
                kind,
                d: None,
            }),
            EventClass::ParameterizedReplaceable => Some(Self {
                pubkey,
                kind,
                d: Some(d),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ReplaceableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind,
            self.pubkey,
            self.d.as_deref().unwrap_or_default()
        )
    }
}

impl Event {
    pub fn class(&self) -> EventClass {
        EventClass::of_kind(self.kind)
    }

    /// Value of the first `d` tag that has one, or the empty string.
    pub fn d_tag(&self) -> &str {
        self.tag_values("d").next().unwrap_or_default()
    }

    /// Replaceable key for replaceable classes, `None` otherwise.
    pub fn replaceable_key(&self) -> Option<ReplaceableKey> {
        match self.class() {
            EventClass::Replaceable => Some(ReplaceableKey {
                pubkey: self.pubkey.clone(),
                kind: self.kind,
                d: None,
            }),
            EventClass::ParameterizedReplaceable => Some(ReplaceableKey {
                pubkey: self.pubkey.clone(),
                kind: self.kind,
                d: Some(self.d_tag().to_string()),
            }),
            _ => None,
        }
    }

    /// Values of all tags named `name` (second element only).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Whether `self` should win over `other` for the same replaceable key.
    ///
    /// Newer `created_at` wins; equal timestamps fall back to the smaller id.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.id < other.id)
    }
}
