//! Entity runtime: one tokio task per entity id.
//!
//! The task owns the entity's state and sequence number. It first recovers
//! from the latest snapshot plus the events recorded after it, then
//! processes messages from its `mpsc` mailbox one at a time. Commands sent
//! while recovery runs wait in the mailbox.
//!
//! Public API: [`EntityHandle`] (cloneable async handle) and
//! [`spawn_entity`] (starts the task).

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::aggregate::{Aggregate, Effect, EntityContext};
use crate::command::CommandContext;
use crate::error::{AskError, StateError};
use crate::event::{PersistenceId, decode_event, encode_event};
use crate::journal::EventJournal;
use crate::retention::RetentionCriteria;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::tagger::{DEFAULT_SHARDS, ShardTagger};

/// How long an entity waits for a message before passivating.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of messages that can wait in an entity's mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Source of command acceptance times.
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Runtime settings for one entity.
///
/// Usually filled in by [`EntityStoreBuilder`](crate::EntityStoreBuilder).
#[derive(Clone)]
pub struct EntityConfig {
    /// How long the entity waits for a message before passivating.
    pub idle_timeout: Duration,
    /// When to snapshot and which snapshots to keep.
    pub retention: RetentionCriteria,
    /// Computes the tags attached to every persisted event.
    pub tagger: ShardTagger,
    /// Mailbox size.
    pub mailbox_capacity: usize,
    /// Source of acceptance times.
    pub clock: Arc<dyn Clock>,
}

impl EntityConfig {
    /// Defaults for aggregate `A`: tags `"{A::EVENT_TAG}{0..10}"`, snapshot
    /// every 100 events keeping 2, five minute idle timeout.
    pub fn for_aggregate<A: Aggregate>() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retention: RetentionCriteria::default(),
            tagger: ShardTagger::for_aggregate::<A>(DEFAULT_SHARDS),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for EntityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityConfig")
            .field("idle_timeout", &self.idle_timeout)
            .field("retention", &self.retention)
            .field("tagger", &self.tagger)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .finish_non_exhaustive()
    }
}

/// Messages sent from [`EntityHandle`] to the entity task.
pub(crate) enum EntityMessage<A: Aggregate> {
    /// Decide a command; the reply is sent once any event is durable.
    Ask {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<A::Reply>,
    },
    /// Read the current state and sequence number.
    GetState { reply: oneshot::Sender<(A, u64)> },
    /// Close the mailbox and stop once everything it accepted is handled.
    Passivate,
}

struct EntityActor<A, J, S> {
    entity_id: String,
    persistence_id: PersistenceId,
    state: A,
    sequence_nr: u64,
    journal: J,
    snapshots: S,
    config: EntityConfig,
    /// Dropped with the actor; handles watch for the close.
    _running: watch::Sender<()>,
}

impl<A, J, S> EntityActor<A, J, S>
where
    A: Aggregate,
    J: EventJournal,
    S: SnapshotStore,
{
    /// Restore state from the latest snapshot and the events after it.
    async fn recover(&mut self) -> io::Result<()> {
        let snapshot = match self.snapshots.load_latest::<A>(&self.persistence_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load snapshot; replaying full history");
                None
            }
        };
        let (mut state, snapshot_sequence_nr) =
            snapshot.map_or((A::default(), 0), |s| (s.state, s.sequence_nr));
        let mut sequence_nr = snapshot_sequence_nr;

        let records = self
            .journal
            .read_from(&self.persistence_id, snapshot_sequence_nr + 1)
            .await?;
        let mut replayed = 0usize;
        for record in &records {
            if record.sequence_nr != sequence_nr + 1 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "stream {}: expected sequence number {}, found {}",
                        self.persistence_id,
                        sequence_nr + 1,
                        record.sequence_nr
                    ),
                ));
            }
            sequence_nr = record.sequence_nr;
            match decode_event::<A>(record) {
                Some(event) => {
                    state = state.apply(&event);
                    replayed += 1;
                }
                None => tracing::warn!(
                    sequence_nr,
                    event_type = %record.event_type,
                    "skipping event that does not decode"
                ),
            }
        }

        self.state = state;
        self.sequence_nr = sequence_nr;
        tracing::info!(
            snapshot_sequence_nr,
            replayed,
            sequence_nr,
            "entity recovered"
        );
        Ok(())
    }

    /// Decide one command and carry out its effect.
    ///
    /// An `Err` means the event could not be made durable; the state is
    /// unchanged and the caller gets no reply.
    async fn process(&mut self, cmd: A::Command, ctx: &CommandContext) -> io::Result<A::Reply> {
        let now = self.config.clock.now();
        let entity_ctx = EntityContext {
            entity_id: &self.entity_id,
            now,
        };
        match self.state.handle(&entity_ctx, cmd) {
            Effect::Reject(err) => {
                tracing::debug!(reason = %err, "command rejected");
                Ok(A::rejected(err))
            }
            Effect::Reply(reply) => Ok(reply),
            Effect::PersistThenReply { event, reply } => {
                let sequence_nr = self.sequence_nr + 1;
                let tags = self.config.tagger.tags_for(&self.entity_id, &event);
                let record = encode_event::<A>(
                    &event,
                    &self.persistence_id,
                    sequence_nr,
                    tags,
                    ctx,
                    now,
                )
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let event_type = record.event_type.clone();

                self.journal.append(record).await?;

                self.state = std::mem::take(&mut self.state).apply(&event);
                self.sequence_nr = sequence_nr;
                tracing::debug!(sequence_nr, %event_type, "event persisted");

                if self.config.retention.should_snapshot(sequence_nr) {
                    self.save_snapshot().await;
                }
                Ok(reply(&self.state))
            }
        }
    }

    /// Snapshot failures are logged; the journal still holds everything.
    async fn save_snapshot(&self) {
        let snapshot = Snapshot {
            state: self.state.clone(),
            sequence_nr: self.sequence_nr,
        };
        match self
            .snapshots
            .save(&self.persistence_id, &snapshot, &self.config.retention)
            .await
        {
            Ok(()) => tracing::info!(sequence_nr = self.sequence_nr, "snapshot saved"),
            Err(e) => tracing::warn!(
                sequence_nr = self.sequence_nr,
                error = %e,
                "failed to save snapshot"
            ),
        }
    }

    /// Handle one message and tell the run loop how to go on.
    async fn handle_message(
        &mut self,
        msg: EntityMessage<A>,
        rx: &mut mpsc::Receiver<EntityMessage<A>>,
    ) -> Step {
        match msg {
            EntityMessage::Ask { cmd, ctx, reply } => {
                let span = tracing::info_span!(
                    "command",
                    correlation_id = ctx.correlation_id.as_deref(),
                );
                match self.process(cmd, &ctx).instrument(span).await {
                    // The caller may have stopped waiting.
                    Ok(result) => {
                        let _ = reply.send(result);
                        Step::Continue
                    }
                    Err(e) => {
                        tracing::error!(
                            sequence_nr = self.sequence_nr + 1,
                            error = %e,
                            "failed to persist event; stopping entity"
                        );
                        // Closed before `reply` drops, so a caller that
                        // sees `NoReply` also sees the handle as dead.
                        rx.close();
                        Step::Failed
                    }
                }
            }
            EntityMessage::GetState { reply } => {
                let _ = reply.send((self.state.clone(), self.sequence_nr));
                Step::Continue
            }
            EntityMessage::Passivate => Step::Passivate,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EntityMessage<A>>) {
        if let Err(e) = self.recover().await {
            tracing::error!(error = %e, "recovery failed; stopping entity");
            return;
        }

        loop {
            let msg = match tokio::time::timeout(self.config.idle_timeout, rx.recv()).await {
                Ok(Some(msg)) => msg,
                // All handles dropped.
                Ok(None) => return,
                Err(_elapsed) => {
                    tracing::debug!("entity idle, passivating");
                    break;
                }
            };
            match self.handle_message(msg, &mut rx).await {
                Step::Continue => {}
                Step::Passivate => {
                    tracing::debug!("passivation requested");
                    break;
                }
                Step::Failed => return,
            }
        }

        // Refuse new messages, then answer everything already accepted,
        // including sends that reserved a slot before the close.
        rx.close();
        let mut drained = 0usize;
        while let Some(msg) = rx.recv().await {
            drained += 1;
            if let Step::Failed = self.handle_message(msg, &mut rx).await {
                return;
            }
        }
        if drained > 0 {
            tracing::debug!(drained, "answered messages queued behind passivation");
        }
    }
}

/// What the run loop does after a message.
enum Step {
    Continue,
    Passivate,
    Failed,
}

/// Async handle to a running entity.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the entity
/// task over a bounded channel.
#[derive(Debug)]
pub struct EntityHandle<A: Aggregate> {
    entity_id: Arc<str>,
    sender: mpsc::Sender<EntityMessage<A>>,
    running: watch::Receiver<()>,
}

// Only the `Arc` and channel ends are cloned, so `A` needs no extra bounds.
impl<A: Aggregate> Clone for EntityHandle<A> {
    fn clone(&self) -> Self {
        Self {
            entity_id: Arc::clone(&self.entity_id),
            sender: self.sender.clone(),
            running: self.running.clone(),
        }
    }
}

impl<A: Aggregate> EntityHandle<A> {
    /// Business id of the entity.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Send a command and wait for its reply.
    ///
    /// Business rejections arrive as an ordinary reply.
    ///
    /// # Errors
    ///
    /// * [`AskError::EntityGone`] -- the entity task has exited; the command
    ///   was not queued.
    /// * [`AskError::NoReply`] -- the entity stopped before replying,
    ///   typically because the journal append failed.
    pub async fn ask(&self, cmd: A::Command, ctx: CommandContext) -> Result<A::Reply, AskError> {
        let rx = self
            .enqueue(cmd, ctx)
            .await
            .map_err(|_| AskError::EntityGone)?;
        rx.await.map_err(|_| AskError::NoReply)
    }

    /// Queue a command. Hands the command back if the entity has exited.
    pub(crate) async fn enqueue(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<oneshot::Receiver<A::Reply>, (A::Command, CommandContext)> {
        let Ok(permit) = self.sender.reserve().await else {
            return Err((cmd, ctx));
        };
        let (tx, rx) = oneshot::channel();
        permit.send(EntityMessage::Ask {
            cmd,
            ctx,
            reply: tx,
        });
        Ok(rx)
    }

    async fn snapshot(&self) -> Result<(A, u64), StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EntityMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::EntityGone)?;
        rx.await.map_err(|_| StateError::EntityGone)
    }

    /// A clone of the current state.
    ///
    /// # Errors
    ///
    /// [`StateError::EntityGone`] if the entity task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        Ok(self.snapshot().await?.0)
    }

    /// Sequence number of the last persisted event, `0` for a new entity.
    ///
    /// # Errors
    ///
    /// [`StateError::EntityGone`] if the entity task has exited.
    pub async fn sequence_nr(&self) -> Result<u64, StateError> {
        Ok(self.snapshot().await?.1)
    }

    /// Ask the entity to stop.
    ///
    /// The mailbox closes once the entity reaches this message; everything
    /// accepted before the close is still answered. Use
    /// [`stopped`](EntityHandle::stopped) to wait for the task to exit.
    pub async fn passivate(&self) {
        // An already stopped entity needs nothing.
        let _ = self.sender.send(EntityMessage::Passivate).await;
    }

    /// Check whether the entity still accepts messages.
    ///
    /// Returns `false` once the entity has begun to passivate or stop. It
    /// may still be answering queued messages; see
    /// [`has_stopped`](EntityHandle::has_stopped).
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Check whether the entity task has exited. An exited task performs no
    /// further journal writes.
    pub fn has_stopped(&self) -> bool {
        self.running.has_changed().is_err()
    }

    /// Wait until the entity task has exited.
    pub async fn stopped(&self) {
        let mut running = self.running.clone();
        // Nothing is ever sent; `changed` fails once the actor drops its end.
        while running.changed().await.is_ok() {}
    }
}

/// Start the entity `entity_id` of aggregate `A` on the current tokio
/// runtime.
///
/// Recovery runs on the spawned task before the first message is read.
/// Callers must ensure at most one live entity per id writes to a journal;
/// [`EntityStore`](crate::EntityStore) does this.
///
/// # Arguments
///
/// * `entity_id` - Business id of the entity (e.g. "cart-1").
/// * `journal` - Journal the entity recovers from and appends to.
/// * `snapshots` - Snapshot store consulted on recovery and written to on
///   the retention interval.
/// * `config` - Idle timeout, retention, tagger, mailbox size and clock.
///
/// # Returns
///
/// An [`EntityHandle`] to the new task. It is returned immediately, before
/// recovery has finished; messages sent meanwhile wait in the mailbox.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn spawn_entity<A, J, S>(
    entity_id: impl Into<String>,
    journal: J,
    snapshots: S,
    config: EntityConfig,
) -> EntityHandle<A>
where
    A: Aggregate,
    J: EventJournal,
    S: SnapshotStore,
{
    let entity_id: String = entity_id.into();
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (running_tx, running_rx) = watch::channel(());
    let span = tracing::info_span!(
        "entity",
        aggregate_type = A::AGGREGATE_TYPE,
        entity_id = %entity_id,
    );
    let actor = EntityActor {
        persistence_id: PersistenceId::of::<A>(entity_id.clone()),
        entity_id: entity_id.clone(),
        state: A::default(),
        sequence_nr: 0,
        journal,
        snapshots,
        config,
        _running: running_tx,
    };
    tokio::spawn(actor.run(rx).instrument(span));

    EntityHandle {
        entity_id: entity_id.into(),
        sender: tx,
        running: running_rx,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cart::{CartCommand, CartReply, ItemId, ShoppingCart};
    use crate::journal::InMemoryJournal;
    use crate::snapshot::InMemorySnapshotStore;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn config() -> EntityConfig {
        EntityConfig {
            clock: Arc::new(FixedClock(at())),
            ..EntityConfig::for_aggregate::<ShoppingCart>()
        }
    }

    fn spawn(
        journal: &InMemoryJournal,
        snapshots: &InMemorySnapshotStore,
        config: EntityConfig,
    ) -> EntityHandle<ShoppingCart> {
        spawn_entity("cart-1", journal.clone(), snapshots.clone(), config)
    }

    fn item(id: &str) -> ItemId {
        ItemId::new(id).expect("valid item id")
    }

    #[tokio::test]
    async fn ask_persists_then_replies_with_new_state() {
        let journal = InMemoryJournal::new();
        let handle = spawn(&journal, &InMemorySnapshotStore::new(), config());

        let reply = handle
            .ask(CartCommand::add_item("A", 2).unwrap(), CommandContext::default())
            .await
            .expect("ask should succeed");

        let summary = reply.summary().expect("accepted");
        assert_eq!(summary.items.get(&item("A")), Some(&2));
        assert_eq!(journal.len(), 1);
        assert_eq!(handle.sequence_nr().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejection_persists_nothing() {
        let journal = InMemoryJournal::new();
        let handle = spawn(&journal, &InMemorySnapshotStore::new(), config());

        let reply = handle
            .ask(CartCommand::Checkout, CommandContext::default())
            .await
            .expect("ask should succeed");
        assert_eq!(
            reply.rejection_reason(),
            Some("Cannot checkout empty shopping cart")
        );
        assert!(journal.is_empty());
        assert_eq!(handle.sequence_nr().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_carries_clock_time_and_context() {
        let journal = InMemoryJournal::new();
        let handle = spawn(&journal, &InMemorySnapshotStore::new(), config());
        let ctx = CommandContext::default().with_correlation_id("req-1");

        handle
            .ask(CartCommand::add_item("A", 1).unwrap(), ctx)
            .await
            .unwrap();

        let records = journal
            .read_from(&PersistenceId::of::<ShoppingCart>("cart-1"), 1)
            .await
            .unwrap();
        assert_eq!(records[0].recorded_at, at());
        assert_eq!(records[0].payload["time"], serde_json::json!(at()));
        assert_eq!(records[0].metadata.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(
            records[0].tags,
            std::collections::BTreeSet::from(["ShoppingCartEvent6".to_string()])
        );
    }

    #[tokio::test]
    async fn append_failure_gives_no_reply_and_stops() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let handle = spawn(&journal, &snapshots, config());
        handle
            .ask(CartCommand::add_item("A", 1).unwrap(), CommandContext::default())
            .await
            .unwrap();

        journal.set_failing(true);
        let err = handle
            .ask(CartCommand::add_item("B", 1).unwrap(), CommandContext::default())
            .await
            .expect_err("append failure must not reply");
        assert!(matches!(err, AskError::NoReply), "got {err:?}");
        assert!(!handle.is_alive());

        handle.stopped().await;
        assert!(handle.has_stopped());

        journal.set_failing(false);
        let handle = spawn(&journal, &snapshots, config());
        let state = handle.state().await.unwrap();
        assert!(state.has_item(&item("A")));
        assert!(!state.has_item(&item("B")));
    }

    #[tokio::test]
    async fn state_recovers_after_passivation() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let handle = spawn(&journal, &snapshots, config());
        let ctx = CommandContext::default();
        handle
            .ask(CartCommand::add_item("A", 2).unwrap(), ctx.clone())
            .await
            .unwrap();
        handle
            .ask(CartCommand::adjust_item_quantity("A", 5).unwrap(), ctx)
            .await
            .unwrap();

        handle.passivate().await;
        handle.stopped().await;
        assert!(!handle.is_alive());

        let handle = spawn(&journal, &snapshots, config());
        assert_eq!(handle.state().await.unwrap().items.get(&item("A")), Some(&5));
        assert_eq!(handle.sequence_nr().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn idle_timeout_passivates() {
        let config = EntityConfig {
            idle_timeout: Duration::from_millis(100),
            ..config()
        };
        let handle = spawn(&InMemoryJournal::new(), &InMemorySnapshotStore::new(), config);
        handle
            .ask(CartCommand::Get, CommandContext::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive(), "entity should passivate when idle");
        assert!(handle.has_stopped());

        let err = handle
            .ask(CartCommand::Get, CommandContext::default())
            .await
            .expect_err("passivated entity must not answer");
        assert!(matches!(err, AskError::EntityGone));
    }

    #[tokio::test]
    async fn snapshot_taken_on_interval() {
        let journal = InMemoryJournal::new();
        let snapshots = InMemorySnapshotStore::new();
        let config = EntityConfig {
            retention: RetentionCriteria::snapshot_every(3, 2),
            ..config()
        };
        let handle = spawn(&journal, &snapshots, config.clone());
        for i in 0..7 {
            let reply = handle
                .ask(
                    CartCommand::add_item(format!("item-{i}"), 1).unwrap(),
                    CommandContext::default(),
                )
                .await
                .unwrap();
            assert!(matches!(reply, CartReply::Accepted(_)));
        }

        let pid = PersistenceId::of::<ShoppingCart>("cart-1");
        assert_eq!(snapshots.sequence_nrs(&pid), vec![3, 6]);

        handle.passivate().await;
        handle.stopped().await;
        let handle = spawn(&journal, &snapshots, config);
        let state = handle.state().await.unwrap();
        assert_eq!(state.items.len(), 7);
        assert_eq!(handle.sequence_nr().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn commands_queued_before_passivate_are_answered() {
        let handle = spawn(&InMemoryJournal::new(), &InMemorySnapshotStore::new(), config());
        let ctx = CommandContext::default();

        let first = handle.ask(CartCommand::add_item("A", 1).unwrap(), ctx.clone());
        let passivate = handle.passivate();
        let (reply, ()) = tokio::join!(first, passivate);
        assert!(matches!(reply, Ok(CartReply::Accepted(_))));
    }

    #[tokio::test]
    async fn messages_accepted_after_passivate_are_still_answered() {
        let journal = InMemoryJournal::new();
        let handle = spawn(&journal, &InMemorySnapshotStore::new(), config());
        let ctx = CommandContext::default();

        // Both land in the mailbox before the entity reads the passivation.
        handle.passivate().await;
        let late_add = handle
            .enqueue(CartCommand::add_item("A", 1).unwrap(), ctx.clone())
            .await
            .expect("mailbox is still open");
        let late_get = handle
            .enqueue(CartCommand::Get, ctx)
            .await
            .expect("mailbox is still open");

        assert!(matches!(late_add.await, Ok(CartReply::Accepted(_))));
        let reply = late_get.await.expect("get must be answered");
        assert_eq!(reply.summary().unwrap().items.get(&item("A")), Some(&1));

        handle.stopped().await;
        assert!(!handle.is_alive());
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn passivated_handle_refuses_new_messages() {
        let handle = spawn(&InMemoryJournal::new(), &InMemorySnapshotStore::new(), config());
        handle.passivate().await;
        handle.stopped().await;

        let err = handle
            .ask(CartCommand::Get, CommandContext::default())
            .await
            .expect_err("stopped entity must refuse");
        assert!(matches!(err, AskError::EntityGone));
        assert!(matches!(handle.state().await, Err(StateError::EntityGone)));
    }
}
