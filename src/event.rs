//! Persisted event records and the encoding between them and domain events.
//!
//! The journal and the tag consumers only ever see [`PersistedEvent`]s; the
//! entity runtime converts typed domain events on the way in and out. No I/O
//! happens here.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Storage identity of an entity: its aggregate type plus business id.
///
/// Journals and snapshot stores key on this. Shard tags are computed from
/// the business id alone (see [`ShardTagger`](crate::ShardTagger)), so the
/// storage identity can change without moving an entity to another shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersistenceId {
    /// Aggregate type name (e.g. "ShoppingCart").
    pub entity_type: String,
    /// Business identifier (e.g. "cart-1").
    pub entity_id: String,
}

impl PersistenceId {
    /// Persistence id for entity `entity_id` of aggregate `A`.
    pub fn of<A: Aggregate>(entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: A::AGGREGATE_TYPE.to_owned(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.entity_type, self.entity_id)
    }
}

/// Infrastructure metadata stamped on every persisted event.
///
/// Makes each record self-describing, so tag consumers can recover the
/// entity identity and audit fields without an external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g. "ShoppingCart").
    pub aggregate_type: String,
    /// Business id of the entity.
    pub entity_id: String,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// One durable entry in an entity's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Unique id of this record.
    pub event_id: Uuid,
    /// Stream this record belongs to.
    pub persistence_id: PersistenceId,
    /// 1-based position within the stream.
    pub sequence_nr: u64,
    /// Event type tag (e.g. "ItemAdded").
    pub event_type: String,
    /// The `"data"` portion of the adjacently tagged domain event.
    pub payload: serde_json::Value,
    /// Shard tags for downstream consumers.
    pub tags: BTreeSet<String>,
    /// Identity and audit metadata.
    pub metadata: EventMetadata,
    /// When the record was handed to the journal.
    pub recorded_at: DateTime<Utc>,
}

/// Encode a domain event into a [`PersistedEvent`].
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`.
/// The `"type"` field becomes `event_type` and `"data"` becomes `payload`
/// (null for fieldless variants).
///
/// # Arguments
///
/// * `event` - Reference to the domain event to encode.
/// * `persistence_id` - Stream the record belongs to (e.g. "ShoppingCart|cart-1").
/// * `sequence_nr` - 1-based position the record will take in the stream.
/// * `tags` - Shard tags computed for the entity.
/// * `ctx` - Command context carrying actor and correlation ID.
/// * `recorded_at` - Acceptance time of the command that produced the event.
///
/// # Returns
///
/// A [`PersistedEvent`] with a fresh UUID v4 event ID and metadata
/// identifying the aggregate type and entity.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or is not
/// adjacently tagged.
pub fn encode_event<A: Aggregate>(
    event: &A::DomainEvent,
    persistence_id: &PersistenceId,
    sequence_nr: u64,
    tags: BTreeSet<String>,
    ctx: &CommandContext,
    recorded_at: DateTime<Utc>,
) -> serde_json::Result<PersistedEvent> {
    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(serde_json::Value::String(event_type)) => event_type,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event must be adjacently tagged with a string 'type'",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(PersistedEvent {
        event_id: Uuid::new_v4(),
        persistence_id: persistence_id.clone(),
        sequence_nr,
        event_type,
        payload,
        tags,
        metadata: EventMetadata {
            aggregate_type: persistence_id.entity_type.clone(),
            entity_id: persistence_id.entity_id.clone(),
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
        },
        recorded_at,
    })
}

/// Decode a [`PersistedEvent`] back into `A::DomainEvent`.
///
/// Returns `None` if the record's type is unknown to `A` or its payload is
/// malformed; callers decide whether that is fatal.
pub fn decode_event<A: Aggregate>(record: &PersistedEvent) -> Option<A::DomainEvent> {
    let tagged = if record.payload.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({
            "type": record.event_type,
            "data": record.payload,
        })
    };
    serde_json::from_value(tagged).ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::cart::{CartEvent, ItemId, ShoppingCart};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn item_added() -> CartEvent {
        CartEvent::ItemAdded {
            cart_id: "cart-1".into(),
            item_id: ItemId::new("A").unwrap(),
            quantity: 3,
            time: at(),
        }
    }

    fn pid() -> PersistenceId {
        PersistenceId::of::<ShoppingCart>("cart-1")
    }

    #[test]
    fn persistence_id_display_joins_type_and_id() {
        assert_eq!(pid().to_string(), "ShoppingCart|cart-1");
    }

    #[test]
    fn encode_splits_type_and_payload() {
        let tags = BTreeSet::from(["ShoppingCartEvent6".to_string()]);
        let record = encode_event::<ShoppingCart>(
            &item_added(),
            &pid(),
            7,
            tags.clone(),
            &CommandContext::default(),
            at(),
        )
        .expect("encode should succeed");

        assert_eq!(record.event_type, "ItemAdded");
        assert_eq!(record.payload["item_id"], "A");
        assert_eq!(record.payload["quantity"], 3);
        assert_eq!(record.sequence_nr, 7);
        assert_eq!(record.tags, tags);
        assert_eq!(record.metadata.aggregate_type, "ShoppingCart");
        assert_eq!(record.metadata.entity_id, "cart-1");
        assert_eq!(
            record.event_id.get_version(),
            Some(uuid::Version::Random),
            "event_id should be UUID v4"
        );
    }

    #[test]
    fn encode_copies_context_into_metadata() {
        let ctx = CommandContext::default()
            .with_actor("u1")
            .with_correlation_id("c1");
        let record =
            encode_event::<ShoppingCart>(&item_added(), &pid(), 1, BTreeSet::new(), &ctx, at())
                .expect("encode should succeed");

        assert_eq!(record.metadata.actor.as_deref(), Some("u1"));
        assert_eq!(record.metadata.correlation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn metadata_omits_absent_fields() {
        let record = encode_event::<ShoppingCart>(
            &item_added(),
            &pid(),
            1,
            BTreeSet::new(),
            &CommandContext::default(),
            at(),
        )
        .expect("encode should succeed");
        let json = serde_json::to_string(&record.metadata).expect("serialize");
        assert!(!json.contains("actor"), "actor should be omitted when None");
        assert!(!json.contains("correlation_id"));
    }

    #[test]
    fn decode_restores_domain_event() {
        let record = encode_event::<ShoppingCart>(
            &item_added(),
            &pid(),
            1,
            BTreeSet::new(),
            &CommandContext::default(),
            at(),
        )
        .expect("encode should succeed");
        assert_eq!(decode_event::<ShoppingCart>(&record), Some(item_added()));
    }

    #[test]
    fn decode_unknown_type_returns_none() {
        let mut record = encode_event::<ShoppingCart>(
            &item_added(),
            &pid(),
            1,
            BTreeSet::new(),
            &CommandContext::default(),
            at(),
        )
        .expect("encode should succeed");
        record.event_type = "ItemGiftWrapped".into();
        assert_eq!(decode_event::<ShoppingCart>(&record), None);
    }
}
