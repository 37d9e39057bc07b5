//! Error type shared by every store operation.

use thiserror::Error;

/// Failures surfaced by the event store.
///
/// Validation errors (`InvalidId`, `InvalidSignature`, `InvalidPubkey`,
/// `MalformedTag`, `InvalidKind`) are terminal for the offending event only. Storage errors
/// are passed through unchanged; the store never retries them.
#[derive(Debug, Error)]
pub enum Error {
    /// The `id` field is not the hash of the event's canonical serialization.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// The Schnorr signature does not verify against `pubkey` and `id`.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// `pubkey` is not a 32-byte x-only key in lowercase hex.
    #[error("invalid pubkey: {0}")]
    InvalidPubkey(String),

    /// A tag is empty.
    #[error("malformed tag at index {0}")]
    MalformedTag(usize),

    /// The kind does not fit in an unsigned 16-bit integer.
    #[error("kind {0} out of range")]
    InvalidKind(u64),

    /// The event id (or its replaceable address) was tombstoned by its author.
    #[error("event {0} was deleted by its author")]
    Deleted(String),

    /// `delete_event` was called with something other than a kind-5 event.
    #[error("kind {0} is not a deletion")]
    NotADeletion(u16),

    /// `replace_event` was called with a kind outside the replaceable ranges.
    #[error("kind {0} is not replaceable")]
    NotReplaceable(u16),

    /// JSON encoding or decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The persistence backend failed.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
