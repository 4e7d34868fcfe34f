//! Aggregate trait, command effects, and the replay fold.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can persist and apply.
/// - `Reply`: the value delivered to the caller of a command.
/// - `Error`: business rejection of a command.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns an [`Effect`] describing
///   what the runtime should do. Persistence is requested, never performed, by the handler.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes ownership of
///   the current state and a reference to a domain event, returning the next state.
///   It must behave identically for freshly persisted and replayed events.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "ShoppingCart"). Used in persistence ids
    /// and as a directory name by the file-backed stores.
    const AGGREGATE_TYPE: &'static str;

    /// Label prefix for the shard tags attached to every persisted event.
    const EVENT_TAG: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + fmt::Debug + 'static;

    /// Value delivered to the caller once a command completes.
    type Reply: Send + fmt::Debug + 'static;

    /// Business rejection type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide what to do with a command given the current state.
    fn handle(&self, ctx: &EntityContext<'_>, cmd: Self::Command) -> Effect<Self>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;

    /// Turn a business rejection into the reply the caller receives.
    fn rejected(err: Self::Error) -> Self::Reply;
}

/// Identity and clock reading handed to [`Aggregate::handle`].
///
/// `now` is sampled by the runtime once per command, so every event a
/// command produces carries the moment the command was accepted.
#[derive(Debug, Clone, Copy)]
pub struct EntityContext<'a> {
    /// Business identity of the entity (not the persistence id).
    pub entity_id: &'a str,
    /// Acceptance time for the command being handled.
    pub now: DateTime<Utc>,
}

/// What the runtime must do after a command has been decided.
pub enum Effect<A: Aggregate> {
    /// The command broke a business rule. Nothing is persisted.
    Reject(A::Error),

    /// Reply immediately without touching durable storage.
    Reply(A::Reply),

    /// Persist `event`, fold it into the state once the journal has
    /// acknowledged it, then reply with `reply(&new_state)`.
    PersistThenReply {
        /// The event to append.
        event: A::DomainEvent,
        /// Builds the reply from the post-fold state.
        reply: fn(&A) -> A::Reply,
    },
}

impl<A: Aggregate> Effect<A> {
    /// Shorthand for [`Effect::PersistThenReply`].
    pub fn persist_then_reply(event: A::DomainEvent, reply: fn(&A) -> A::Reply) -> Self {
        Self::PersistThenReply { event, reply }
    }

    /// The event this effect wants persisted, if any.
    pub fn event(&self) -> Option<&A::DomainEvent> {
        match self {
            Self::PersistThenReply { event, .. } => Some(event),
            Self::Reject(_) | Self::Reply(_) => None,
        }
    }
}

impl<A: Aggregate> fmt::Debug for Effect<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject(err) => f.debug_tuple("Reject").field(err).finish(),
            Self::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            Self::PersistThenReply { event, .. } => f
                .debug_struct("PersistThenReply")
                .field("event", event)
                .finish_non_exhaustive(),
        }
    }
}

/// Fold a sequence of events into `initial`.
///
/// Recovery uses this with the latest snapshot (or the default state) as
/// `initial` and the events recorded after it.
pub fn replay<'a, A: Aggregate>(
    initial: A,
    events: impl IntoIterator<Item = &'a A::DomainEvent>,
) -> A {
    events
        .into_iter()
        .fold(initial, |state, event| state.apply(event))
}

/// Run one command to completion without a journal.
///
/// Decides the command, folds the produced event (if any) and builds the
/// reply exactly as the entity runtime does after a successful append.
/// Returns the next state, the event that would have been persisted, and
/// the reply.
pub fn decide_and_apply<A: Aggregate>(
    state: A,
    ctx: &EntityContext<'_>,
    cmd: A::Command,
) -> (A, Option<A::DomainEvent>, A::Reply) {
    match state.handle(ctx, cmd) {
        Effect::Reject(err) => (state, None, A::rejected(err)),
        Effect::Reply(reply) => (state, None, reply),
        Effect::PersistThenReply { event, reply } => {
            let next = state.apply(&event);
            let reply = reply(&next);
            (next, Some(event), reply)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cart::{CartCommand, CartEvent, CartReply, ItemId, ShoppingCart};

    fn ctx() -> EntityContext<'static> {
        EntityContext {
            entity_id: "cart-1",
            now: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn item(id: &str) -> ItemId {
        ItemId::new(id).expect("valid item id")
    }

    #[test]
    fn effect_event_exposes_persisted_event_only() {
        let cart = ShoppingCart::default();
        let effect = cart.handle(
            &ctx(),
            CartCommand::AddItem {
                item_id: item("A"),
                quantity: 1,
            },
        );
        assert!(matches!(
            effect.event(),
            Some(CartEvent::ItemAdded { quantity: 1, .. })
        ));

        let effect = cart.handle(&ctx(), CartCommand::Get);
        assert!(effect.event().is_none());
    }

    #[test]
    fn effect_debug_names_variant() {
        let effect = ShoppingCart::default().handle(&ctx(), CartCommand::Checkout);
        let debug = format!("{effect:?}");
        assert!(debug.starts_with("Reject"), "got: {debug}");
    }

    #[test]
    fn replay_empty_history_is_initial_state() {
        let state = replay::<ShoppingCart>(ShoppingCart::default(), &[]);
        assert_eq!(state, ShoppingCart::default());
    }

    #[test]
    fn decide_and_apply_folds_before_replying() {
        let (state, event, reply) = decide_and_apply(
            ShoppingCart::default(),
            &ctx(),
            CartCommand::AddItem {
                item_id: item("A"),
                quantity: 2,
            },
        );
        assert!(event.is_some());
        assert_eq!(state.items.get(&item("A")), Some(&2));
        match reply {
            CartReply::Accepted(summary) => assert_eq!(summary.items.get(&item("A")), Some(&2)),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn decide_and_apply_rejection_keeps_state() {
        let (state, event, reply) =
            decide_and_apply(ShoppingCart::default(), &ctx(), CartCommand::Checkout);
        assert_eq!(state, ShoppingCart::default());
        assert!(event.is_none());
        assert!(matches!(reply, CartReply::Rejected { .. }));
    }
}
