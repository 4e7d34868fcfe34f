//! Top-level entry point that routes commands to entities by id.
//!
//! [`EntityStore`] caches one [`EntityHandle`] per entity id and re-spawns
//! entities that have passivated or stopped, so callers never manage entity
//! lifecycles themselves. It is configured via [`EntityStoreBuilder`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::entity::{Clock, EntityConfig, EntityHandle, spawn_entity};
use crate::error::AskError;
use crate::journal::EventJournal;
use crate::retention::RetentionCriteria;
use crate::snapshot::SnapshotStore;
use crate::tagger::ShardTagger;

/// Handle cache keyed by entity id.
type HandleCache<A> = HashMap<String, EntityHandle<A>>;

/// Registry of live entities of aggregate `A`.
///
/// At most one live entity per id exists for a given store: handles are
/// spawned under the cache's write lock, and a cached handle is only
/// replaced once its task has exited. Clones share the cache.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
pub struct EntityStore<A: Aggregate, J, S> {
    cache: Arc<RwLock<HandleCache<A>>>,
    journal: J,
    snapshots: S,
    config: EntityConfig,
}

impl<A: Aggregate, J: Clone, S: Clone> Clone for EntityStore<A, J, S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            journal: self.journal.clone(),
            snapshots: self.snapshots.clone(),
            config: self.config.clone(),
        }
    }
}

impl<A: Aggregate, J, S> fmt::Debug for EntityStore<A, J, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<A, J, S> EntityStore<A, J, S>
where
    A: Aggregate,
    J: EventJournal,
    S: SnapshotStore,
{
    /// Store with default settings.
    pub fn new(journal: J, snapshots: S) -> Self {
        EntityStoreBuilder::new(journal, snapshots).build()
    }

    /// Start configuring a store.
    pub fn builder(journal: J, snapshots: S) -> EntityStoreBuilder<A, J, S> {
        EntityStoreBuilder::new(journal, snapshots)
    }

    /// The journal this store persists to, for tag consumers.
    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// The snapshot store this store uses.
    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    /// Settings applied to every entity spawned by this store.
    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    /// Get a handle to an entity, spawning it if needed.
    ///
    /// If the entity is already running (cached and alive), returns a clone
    /// of the existing handle. If the cached entity is passivating, waits
    /// for its task to exit first. Otherwise spawns a new entity, which
    /// recovers its state before handling the first message.
    ///
    /// # Errors
    ///
    /// [`AskError::InvalidEntityId`] if `entity_id` is empty.
    pub async fn entity(&self, entity_id: &str) -> Result<EntityHandle<A>, AskError> {
        if entity_id.is_empty() {
            return Err(AskError::InvalidEntityId);
        }

        loop {
            // Fast path: check cache with read lock.
            let stale = {
                let cache = self.cache.read().await;
                match cache.get(entity_id) {
                    Some(handle) if handle.is_alive() => return Ok(handle.clone()),
                    other => other.cloned(),
                }
            };
            // The old task may still be answering its queue.
            if let Some(stale) = stale {
                stale.stopped().await;
            }

            // Slow path: re-check under the write lock so concurrent callers
            // spawn at most one entity.
            let mut cache = self.cache.write().await;
            match cache.get(entity_id) {
                Some(handle) if handle.is_alive() => return Ok(handle.clone()),
                Some(handle) if !handle.has_stopped() => continue,
                _ => {}
            }

            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                entity_id = %entity_id,
                "spawning entity"
            );
            let handle = spawn_entity::<A, J, S>(
                entity_id,
                self.journal.clone(),
                self.snapshots.clone(),
                self.config.clone(),
            );
            cache.insert(entity_id.to_owned(), handle.clone());
            return Ok(handle);
        }
    }

    /// Send a command to an entity and wait for the reply.
    ///
    /// If the cached entity stopped before the command could be queued, the
    /// entity is re-spawned and the command is queued there instead. A
    /// command the entity accepted is never sent twice.
    ///
    /// # Arguments
    ///
    /// * `entity_id` - Business id of the target entity (e.g. "cart-1").
    /// * `cmd` - The command to decide.
    /// * `ctx` - Actor and correlation id stamped on any persisted event.
    ///
    /// # Returns
    ///
    /// The entity's reply, sent only after any event the command produced
    /// is durable. Business rejections are ordinary replies.
    ///
    /// # Errors
    ///
    /// * [`AskError::InvalidEntityId`] -- `entity_id` is empty.
    /// * [`AskError::NoReply`] -- the entity stopped before replying,
    ///   typically because the journal append failed. The next call
    ///   re-spawns and recovers it.
    /// * [`AskError::EntityGone`] -- the re-spawned entity also stopped
    ///   before the command could be queued.
    pub async fn ask(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, AskError> {
        let handle = self.entity(entity_id).await?;
        let rx = match handle.enqueue(cmd, ctx).await {
            Ok(rx) => rx,
            Err((cmd, ctx)) => {
                let handle = self.entity(entity_id).await?;
                handle
                    .enqueue(cmd, ctx)
                    .await
                    .map_err(|_| AskError::EntityGone)?
            }
        };
        rx.await.map_err(|_| AskError::NoReply)
    }

    /// Ids of the entities currently running, sorted.
    pub async fn live_entities(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut ids: Vec<String> = cache
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Passivate every cached entity and wait for their tasks to exit.
    ///
    /// Commands already queued are answered first. Commands sent meanwhile
    /// go to a fresh entity spawned after the old one has exited.
    pub async fn passivate_all(&self) {
        let handles: Vec<EntityHandle<A>> = self.cache.read().await.values().cloned().collect();
        for handle in &handles {
            handle.passivate().await;
        }
        for handle in &handles {
            handle.stopped().await;
        }
        self.cache
            .write()
            .await
            .retain(|_, handle| !handle.has_stopped());
    }
}

/// Builder for configuring and opening an [`EntityStore`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use shopping_cart_es::{
///     EntityStore, InMemoryJournal, InMemorySnapshotStore, RetentionCriteria, ShoppingCart,
/// };
///
/// let store: EntityStore<ShoppingCart, _, _> =
///     EntityStore::builder(InMemoryJournal::new(), InMemorySnapshotStore::new())
///         .idle_timeout(Duration::from_secs(60))
///         .retention(RetentionCriteria::snapshot_every(50, 2))
///         .shards(10)
///         .build();
/// ```
pub struct EntityStoreBuilder<A: Aggregate, J, S> {
    journal: J,
    snapshots: S,
    config: EntityConfig,
    _aggregate: std::marker::PhantomData<fn() -> A>,
}

impl<A, J, S> EntityStoreBuilder<A, J, S>
where
    A: Aggregate,
    J: EventJournal,
    S: SnapshotStore,
{
    /// Create a builder with default settings.
    pub fn new(journal: J, snapshots: S) -> Self {
        Self {
            journal,
            snapshots,
            config: EntityConfig::for_aggregate::<A>(),
            _aggregate: std::marker::PhantomData,
        }
    }

    /// Set how long an entity may stay idle before passivating.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set when entities snapshot and which snapshots are kept.
    ///
    /// Defaults to every 100 events, keeping 2.
    pub fn retention(mut self, retention: RetentionCriteria) -> Self {
        self.config.retention = retention;
        self
    }

    /// Set the number of event tag shards.
    ///
    /// Defaults to 10. Changing it moves entities to other tags, so it must
    /// stay fixed once events have been written.
    pub fn shards(mut self, shards: u32) -> Self {
        self.config.tagger = ShardTagger::for_aggregate::<A>(shards);
        self
    }

    /// Set the per-entity mailbox size. Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the clock used to timestamp accepted commands.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.config.clock = Arc::new(clock);
        self
    }

    /// Build the store. No entity is spawned until first use.
    pub fn build(self) -> EntityStore<A, J, S> {
        EntityStore {
            cache: Arc::new(RwLock::new(HashMap::new())),
            journal: self.journal,
            snapshots: self.snapshots,
            config: self.config,
        }
    }
}
