//! Shard tags for downstream consumers of the event stream.
//!
//! Every event an entity persists is tagged with one shard label derived
//! from the entity's business id alone. Consumers subscribe per shard, and
//! because all events of one entity share a shard they see that entity's
//! events in order.

use std::collections::BTreeSet;

use crate::aggregate::Aggregate;

/// Number of shards used when none is configured.
pub const DEFAULT_SHARDS: u32 = 10;

/// Assigns shard tags to events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTagger {
    prefix: String,
    shards: u32,
}

impl ShardTagger {
    /// Create a tagger that labels shards `"{prefix}0"` .. `"{prefix}{shards - 1}"`.
    ///
    /// A shard count of zero is treated as one.
    pub fn new(prefix: impl Into<String>, shards: u32) -> Self {
        Self {
            prefix: prefix.into(),
            shards: shards.max(1),
        }
    }

    /// Tagger for aggregate `A`, using [`Aggregate::EVENT_TAG`] as the prefix.
    pub fn for_aggregate<A: Aggregate>(shards: u32) -> Self {
        Self::new(A::EVENT_TAG, shards)
    }

    /// Number of shards.
    pub fn shards(&self) -> u32 {
        self.shards
    }

    /// Shard number for an entity.
    ///
    /// Computed as `|string_hash(entity_id) mod shards|`, which gives the
    /// same answer in every process and on every build.
    ///
    /// # Arguments
    ///
    /// * `entity_id` - Business id of the entity (e.g. "cart-1"), not its
    ///   persistence id.
    ///
    /// # Returns
    ///
    /// A shard number in `0..shards`; pass it to
    /// [`label`](ShardTagger::label) for the tag string.
    ///
    /// # Examples
    ///
    /// ```
    /// use shopping_cart_es::ShardTagger;
    ///
    /// let tagger = ShardTagger::new("ShoppingCartEvent", 10);
    /// let shard = tagger.shard_for("cart-1");
    /// assert_eq!(shard, tagger.shard_for("cart-1")); // deterministic
    /// assert_eq!(tagger.label(shard), "ShoppingCartEvent6");
    /// ```
    pub fn shard_for(&self, entity_id: &str) -> u32 {
        let remainder = i64::from(string_hash(entity_id)) % i64::from(self.shards);
        // |remainder| < shards, so it always fits.
        remainder.unsigned_abs() as u32
    }

    /// Label of shard `shard`.
    pub fn label(&self, shard: u32) -> String {
        format!("{}{shard}", self.prefix)
    }

    /// Tags for an event persisted by `entity_id`.
    ///
    /// The event payload is deliberately ignored: the tag depends only on
    /// the entity id.
    pub fn tags_for<E>(&self, entity_id: &str, _event: &E) -> BTreeSet<String> {
        BTreeSet::from([self.label(self.shard_for(entity_id))])
    }

    /// Every tag this tagger can produce, in shard order.
    pub fn all_tags(&self) -> Vec<String> {
        (0..self.shards).map(|shard| self.label(shard)).collect()
    }
}

/// 32-bit polynomial string hash over UTF-16 code units (`h = 31 * h + unit`,
/// wrapping).
///
/// This is the hash existing shard-tag consumers were partitioned with, so
/// it must not change.
pub fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}
