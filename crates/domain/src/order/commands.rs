//! Order commands.
//!
//! Commands carry their own `occurred_at`: the caller states when the
//! action happened and that timestamp flows into the produced events
//! unchanged.

use chrono::{DateTime, Utc};
use common::StreamId;
use serde::{Deserialize, Serialize};

use super::{CustomerId, ItemId};

/// Command to create a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
    /// The new order's stream ID.
    pub order_id: StreamId,

    /// The customer placing the order.
    pub customer_id: CustomerId,

    /// Free-text description.
    pub description: String,

    /// When the order was placed.
    pub occurred_at: DateTime<Utc>,
}

impl CreateOrder {
    /// Creates the command for a specific order ID.
    pub fn new(
        order_id: StreamId,
        customer_id: CustomerId,
        description: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            customer_id,
            description: description.into(),
            occurred_at,
        }
    }

    /// Creates the command with a freshly generated order ID.
    pub fn for_customer(
        customer_id: CustomerId,
        description: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self::new(StreamId::new(), customer_id, description, occurred_at)
    }
}

/// Command to add an item to an existing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOrderItem {
    /// The order to add to.
    pub order_id: StreamId,

    /// The item being added.
    pub item_id: ItemId,

    /// Item display name.
    pub item_name: String,

    /// Quantity to add; must be greater than zero.
    pub quantity: u32,

    /// When the item was added.
    pub occurred_at: DateTime<Utc>,
}

impl AddOrderItem {
    /// Creates the command.
    pub fn new(
        order_id: StreamId,
        item_id: ItemId,
        item_name: impl Into<String>,
        quantity: u32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            item_id,
            item_name: item_name.into(),
            quantity,
            occurred_at,
        }
    }
}

/// Command to mark an order as shipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipOrder {
    /// The order to ship.
    pub order_id: StreamId,

    /// When the order shipped.
    pub occurred_at: DateTime<Utc>,
}

impl ShipOrder {
    /// Creates the command.
    pub fn new(order_id: StreamId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            occurred_at,
        }
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrder {
    /// The order to cancel.
    pub order_id: StreamId,

    /// Reason for cancellation; must not be empty.
    pub reason: String,

    /// When the order was cancelled.
    pub occurred_at: DateTime<Utc>,
}

impl CancelOrder {
    /// Creates the command.
    pub fn new(
        order_id: StreamId,
        reason: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            reason: reason.into(),
            occurred_at,
        }
    }
}
