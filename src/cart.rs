//! Shopping cart aggregate.
//!
//! A cart is open until it is checked out. While open, items can be added,
//! removed, and have their quantity adjusted; checking out requires at least
//! one item. A checked-out cart rejects every mutation but still answers
//! `Get`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, Effect, EntityContext};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A non-empty item identifier.
///
/// Commands can only carry an `ItemId`, so an empty id is refused where the
/// command is built (or deserialized) and never reaches the handler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

/// Returned when an item id is empty.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("itemId must not be empty")]
pub struct InvalidItemId;

impl ItemId {
    /// Validate and wrap an item id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidItemId`] if `id` is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidItemId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidItemId);
        }
        Ok(Self(id))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ItemId {
    type Error = InvalidItemId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Current state of one cart.
///
/// Every quantity in `items` is strictly positive; `checkout_date` is set
/// exactly when the cart has been checked out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCart {
    /// Quantity per item.
    pub items: BTreeMap<ItemId, u32>,
    /// When the cart was checked out, if it has been.
    pub checkout_date: Option<DateTime<Utc>>,
}

impl ShoppingCart {
    /// Whether the cart still accepts mutations.
    pub fn is_open(&self) -> bool {
        self.checkout_date.is_none()
    }

    /// Whether the cart has been checked out.
    pub fn is_checked_out(&self) -> bool {
        self.checkout_date.is_some()
    }

    /// Whether `item_id` is in the cart.
    pub fn has_item(&self, item_id: &ItemId) -> bool {
        self.items.contains_key(item_id)
    }

    /// Snapshot of the cart as seen by callers.
    pub fn summary(&self) -> Summary {
        Summary {
            items: self.items.clone(),
            checked_out: self.is_checked_out(),
            checkout_date: self.checkout_date,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`ShoppingCart`] aggregate.
///
/// The reply channel travels next to the command inside the entity's
/// mailbox (see [`EntityHandle::ask`](crate::EntityHandle::ask)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartCommand {
    /// Put a new item in the cart.
    AddItem { item_id: ItemId, quantity: i32 },
    /// Take an item out of the cart. Removing an absent item succeeds.
    RemoveItem { item_id: ItemId },
    /// Replace the quantity of an item already in the cart.
    AdjustItemQuantity { item_id: ItemId, quantity: i32 },
    /// Read the cart.
    Get,
    /// Close the cart.
    Checkout,
}

impl CartCommand {
    /// Build an `AddItem` command.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidItemId`] if `item_id` is empty.
    pub fn add_item(item_id: impl Into<String>, quantity: i32) -> Result<Self, InvalidItemId> {
        Ok(Self::AddItem {
            item_id: ItemId::new(item_id)?,
            quantity,
        })
    }

    /// Build a `RemoveItem` command.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidItemId`] if `item_id` is empty.
    pub fn remove_item(item_id: impl Into<String>) -> Result<Self, InvalidItemId> {
        Ok(Self::RemoveItem {
            item_id: ItemId::new(item_id)?,
        })
    }

    /// Build an `AdjustItemQuantity` command.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidItemId`] if `item_id` is empty.
    pub fn adjust_item_quantity(
        item_id: impl Into<String>,
        quantity: i32,
    ) -> Result<Self, InvalidItemId> {
        Ok(Self::AdjustItemQuantity {
            item_id: ItemId::new(item_id)?,
            quantity,
        })
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`ShoppingCart`] aggregate.
///
/// Each event carries the cart's business id and the time its command was
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartEvent {
    /// An item was added.
    ItemAdded {
        cart_id: String,
        item_id: ItemId,
        quantity: u32,
        time: DateTime<Utc>,
    },
    /// An item was removed.
    ItemRemoved {
        cart_id: String,
        item_id: ItemId,
        time: DateTime<Utc>,
    },
    /// An item's quantity was replaced.
    ItemQuantityAdjusted {
        cart_id: String,
        item_id: ItemId,
        quantity: u32,
        time: DateTime<Utc>,
    },
    /// The cart was checked out.
    CheckedOut { cart_id: String, time: DateTime<Utc> },
}

impl CartEvent {
    /// Business id of the cart that produced this event.
    pub fn cart_id(&self) -> &str {
        match self {
            Self::ItemAdded { cart_id, .. }
            | Self::ItemRemoved { cart_id, .. }
            | Self::ItemQuantityAdjusted { cart_id, .. }
            | Self::CheckedOut { cart_id, .. } => cart_id,
        }
    }

    /// When the command behind this event was accepted.
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::ItemAdded { time, .. }
            | Self::ItemRemoved { time, .. }
            | Self::ItemQuantityAdjusted { time, .. }
            | Self::CheckedOut { time, .. } => *time,
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// The cart as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Quantity per item.
    pub items: BTreeMap<ItemId, u32>,
    /// Whether the cart has been checked out.
    pub checked_out: bool,
    /// When the cart was checked out, if it has been.
    pub checkout_date: Option<DateTime<Utc>>,
}

/// Reply delivered for every [`CartCommand`].
///
/// Mutating commands and `Checkout` answer with `Accepted` or `Rejected`;
/// `Get` answers with `Summary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartReply {
    /// The command succeeded; carries the cart after the command.
    Accepted(Summary),
    /// A business rule refused the command.
    Rejected { reason: String },
    /// Answer to `Get`.
    Summary(Summary),
}

impl CartReply {
    /// The rejection reason, if this reply is a rejection.
    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            Self::Accepted(_) | Self::Summary(_) => None,
        }
    }

    /// The summary carried by this reply, if any.
    pub fn summary(&self) -> Option<&Summary> {
        match self {
            Self::Accepted(summary) | Self::Summary(summary) => Some(summary),
            Self::Rejected { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Business rules that can refuse a [`CartCommand`].
///
/// The `Display` output is the reason string sent back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CartRejection {
    #[error("Item was already added to this shopping cart")]
    ItemAlreadyAdded,
    #[error("Quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("Item not found in shopping cart")]
    ItemNotFound,
    #[error("Cannot checkout empty shopping cart")]
    EmptyCart,
    #[error("Cannot add an item to a checked-out cart")]
    AddToCheckedOut,
    // The wording matches what existing clients already match on.
    #[error("Cannot remove an item to a checked-out cart")]
    RemoveFromCheckedOut,
    #[error("Cannot adjust item quantity in a checked-out cart")]
    AdjustCheckedOut,
    #[error("Cannot checkout a checked-out cart")]
    CheckoutCheckedOut,
}

// ---------------------------------------------------------------------------
// Aggregate impl
// ---------------------------------------------------------------------------

fn accepted(cart: &ShoppingCart) -> CartReply {
    CartReply::Accepted(cart.summary())
}

/// Quantities must be strictly positive; nothing is clamped.
fn positive(quantity: i32) -> Option<u32> {
    u32::try_from(quantity).ok().filter(|q| *q > 0)
}

impl ShoppingCart {
    fn on_add_item(&self, ctx: &EntityContext<'_>, item_id: ItemId, quantity: i32) -> Effect<Self> {
        if self.is_checked_out() {
            return Effect::Reject(CartRejection::AddToCheckedOut);
        }
        if self.has_item(&item_id) {
            return Effect::Reject(CartRejection::ItemAlreadyAdded);
        }
        let Some(quantity) = positive(quantity) else {
            return Effect::Reject(CartRejection::NonPositiveQuantity);
        };
        Effect::persist_then_reply(
            CartEvent::ItemAdded {
                cart_id: ctx.entity_id.to_owned(),
                item_id,
                quantity,
                time: ctx.now,
            },
            accepted,
        )
    }

    fn on_remove_item(&self, ctx: &EntityContext<'_>, item_id: ItemId) -> Effect<Self> {
        if self.is_checked_out() {
            return Effect::Reject(CartRejection::RemoveFromCheckedOut);
        }
        if !self.has_item(&item_id) {
            // Removing an absent item is a no-op; nothing is recorded.
            return Effect::Reply(accepted(self));
        }
        Effect::persist_then_reply(
            CartEvent::ItemRemoved {
                cart_id: ctx.entity_id.to_owned(),
                item_id,
                time: ctx.now,
            },
            accepted,
        )
    }

    fn on_adjust_item_quantity(
        &self,
        ctx: &EntityContext<'_>,
        item_id: ItemId,
        quantity: i32,
    ) -> Effect<Self> {
        if self.is_checked_out() {
            return Effect::Reject(CartRejection::AdjustCheckedOut);
        }
        let Some(quantity) = positive(quantity) else {
            return Effect::Reject(CartRejection::NonPositiveQuantity);
        };
        if !self.has_item(&item_id) {
            return Effect::Reject(CartRejection::ItemNotFound);
        }
        Effect::persist_then_reply(
            CartEvent::ItemQuantityAdjusted {
                cart_id: ctx.entity_id.to_owned(),
                item_id,
                quantity,
                time: ctx.now,
            },
            accepted,
        )
    }

    fn on_checkout(&self, ctx: &EntityContext<'_>) -> Effect<Self> {
        if self.is_checked_out() {
            return Effect::Reject(CartRejection::CheckoutCheckedOut);
        }
        if self.items.is_empty() {
            return Effect::Reject(CartRejection::EmptyCart);
        }
        Effect::persist_then_reply(
            CartEvent::CheckedOut {
                cart_id: ctx.entity_id.to_owned(),
                time: ctx.now,
            },
            accepted,
        )
    }
}

impl Aggregate for ShoppingCart {
    const AGGREGATE_TYPE: &'static str = "ShoppingCart";
    const EVENT_TAG: &'static str = "ShoppingCartEvent";

    type Command = CartCommand;
    type DomainEvent = CartEvent;
    type Reply = CartReply;
    type Error = CartRejection;

    fn handle(&self, ctx: &EntityContext<'_>, cmd: CartCommand) -> Effect<Self> {
        match cmd {
            CartCommand::Get => Effect::Reply(CartReply::Summary(self.summary())),
            CartCommand::AddItem { item_id, quantity } => self.on_add_item(ctx, item_id, quantity),
            CartCommand::RemoveItem { item_id } => self.on_remove_item(ctx, item_id),
            CartCommand::AdjustItemQuantity { item_id, quantity } => {
                self.on_adjust_item_quantity(ctx, item_id, quantity)
            }
            CartCommand::Checkout => self.on_checkout(ctx),
        }
    }

    fn apply(mut self, event: &CartEvent) -> Self {
        match event {
            CartEvent::ItemAdded {
                item_id, quantity, ..
            }
            | CartEvent::ItemQuantityAdjusted {
                item_id, quantity, ..
            } => {
                self.items.insert(item_id.clone(), *quantity);
            }
            CartEvent::ItemRemoved { item_id, .. } => {
                self.items.remove(item_id);
            }
            CartEvent::CheckedOut { time, .. } => self.checkout_date = Some(*time),
        }
        self
    }

    fn rejected(err: CartRejection) -> CartReply {
        CartReply::Rejected {
            reason: err.to_string(),
        }
    }
}
