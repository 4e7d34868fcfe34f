//! Event-sourced shopping cart entities.
//!
//! A [`ShoppingCart`] decides commands against its current state and records
//! the outcome as events; its state is the fold of those events. Each cart
//! runs as one tokio task that persists an event before replying, tags it
//! with a stable shard label, and snapshots on a fixed interval.
//! [`EntityStore`] routes commands to carts by id.

mod aggregate;
pub use aggregate::{Aggregate, Effect, EntityContext, decide_and_apply, replay};
mod cart;
pub use cart::{
    CartCommand, CartEvent, CartRejection, CartReply, InvalidItemId, ItemId, ShoppingCart, Summary,
};
mod command;
mod entity;
mod error;
mod event;
mod journal;
mod retention;
mod snapshot;
mod storage;
mod store;
mod tagger;

pub use command::CommandContext;
pub use entity::{
    Clock, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAILBOX_CAPACITY, EntityConfig, EntityHandle, FixedClock,
    SystemClock, spawn_entity,
};
pub use error::{AskError, StateError};
pub use event::{EventMetadata, PersistedEvent, PersistenceId, decode_event, encode_event};
pub use journal::{EventJournal, InMemoryJournal};
pub use retention::{DEFAULT_KEEP_SNAPSHOTS, DEFAULT_SNAPSHOT_EVERY, RetentionCriteria};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use storage::{FileJournal, StreamLayout};
pub use store::{EntityStore, EntityStoreBuilder};
pub use tagger::{DEFAULT_SHARDS, ShardTagger, string_hash};
