//! Nostr event store: validated ingestion, filter queries, replaceable-event
//! resolution and NIP-09 deletions over a pluggable key-value backend.

pub mod backend;
pub mod codec;
pub mod config;
pub mod deletion;
pub mod error;
pub mod event;
pub mod filter;
pub mod index;
pub mod locks;
pub mod resolver;
pub mod store;

pub use backend::{Backend, FsBackend, MemoryBackend};
pub use error::{Error, Result};
pub use event::{Event, EventClass, ReplaceableKey, Tag};
pub use filter::{Filter, UntilBound};
pub use store::{EventStream, LoadStats, SaveOutcome, Store, StoreOptions};
