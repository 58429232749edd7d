//! Order aggregate implementation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::StreamId;
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, SnapshotCapable};

use super::{CustomerId, ItemId, OrderError, OrderEvent, OrderLine};

/// Order aggregate root, reconstructed by folding its stream.
///
/// After shipping or cancellation the order is terminal: no further item
/// additions, shipping or cancellation is accepted. Validation runs
/// against this in-memory state; serializing access to the stream is the
/// command handler's job (expected-version commit).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order (stream) identifier; None before the first event.
    id: Option<StreamId>,

    /// Mirrors the applied-event count, for optimistic concurrency.
    #[serde(default)]
    version: Version,

    /// Customer who placed the order.
    customer_id: Option<CustomerId>,

    /// Free-text description given at creation.
    description: String,

    /// True once the order shipped (terminal).
    is_shipped: bool,

    /// True once the order was cancelled (terminal).
    is_cancelled: bool,

    /// Items keyed by item id; repeated additions accumulate quantity.
    items: HashMap<ItemId, OrderLine>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn stream_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<StreamId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderCreated(data) => {
                self.id = Some(data.order_id);
                self.customer_id = Some(data.customer_id);
                self.description = data.description;
            }
            OrderEvent::OrderItemAdded(data) => {
                self.items
                    .entry(data.item_id)
                    .and_modify(|line| line.quantity += data.quantity)
                    .or_insert_with(|| OrderLine::new(data.item_name, data.quantity));
            }
            OrderEvent::OrderShipped(_) => {
                self.is_shipped = true;
            }
            OrderEvent::OrderCancelled(_) => {
                self.is_cancelled = true;
            }
        }
    }
}

impl SnapshotCapable for Order {
    fn snapshot_interval() -> usize {
        50
    }
}

// Query methods
impl Order {
    /// Returns the customer ID.
    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    /// Returns the order description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns true once the order shipped.
    pub fn is_shipped(&self) -> bool {
        self.is_shipped
    }

    /// Returns true once the order was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled
    }

    /// Returns true when no further state changes are accepted.
    pub fn is_terminal(&self) -> bool {
        self.is_shipped || self.is_cancelled
    }

    /// Returns the order lines keyed by item id.
    pub fn items(&self) -> &HashMap<ItemId, OrderLine> {
        &self.items
    }

    /// Returns one order line.
    pub fn item(&self, item_id: &ItemId) -> Option<&OrderLine> {
        self.items.get(item_id)
    }

    /// Number of distinct items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Sum of all quantities across items.
    pub fn total_quantity(&self) -> u32 {
        self.items.values().map(|line| line.quantity).sum()
    }
}

// Behavior methods: validate against in-memory state, produce events.
// No event is ever produced for a call that fails validation.
impl Order {
    /// Creates the order. Only valid on a fresh aggregate.
    pub fn create(
        &self,
        order_id: StreamId,
        customer_id: CustomerId,
        description: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyCreated);
        }

        let description = description.into();
        if description.trim().is_empty() {
            return Err(OrderError::EmptyDescription);
        }

        Ok(vec![OrderEvent::order_created(
            order_id,
            customer_id,
            description,
            occurred_at,
        )])
    }

    /// Adds an item; repeated item ids accumulate quantity at fold time.
    pub fn add_item(
        &self,
        item_id: ItemId,
        item_name: impl Into<String>,
        quantity: u32,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_shipped {
            return Err(OrderError::AlreadyShipped);
        }
        if self.is_cancelled {
            return Err(OrderError::AlreadyCancelled);
        }
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity { quantity });
        }

        let item_name = item_name.into();
        if item_name.trim().is_empty() {
            return Err(OrderError::EmptyItemName);
        }

        let order_id = self.id.expect("add_item on an order that was never created");
        Ok(vec![OrderEvent::order_item_added(
            order_id,
            item_id,
            item_name,
            quantity,
            occurred_at,
        )])
    }

    /// Ships the order.
    pub fn ship(&self, occurred_at: DateTime<Utc>) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_shipped {
            return Err(OrderError::AlreadyShipped);
        }
        if self.is_cancelled {
            return Err(OrderError::AlreadyCancelled);
        }

        let order_id = self.id.expect("ship on an order that was never created");
        Ok(vec![OrderEvent::order_shipped(order_id, occurred_at)])
    }

    /// Cancels the order. A shipped order can never be cancelled.
    pub fn cancel(
        &self,
        reason: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.is_shipped {
            return Err(OrderError::CannotCancelShipped);
        }
        if self.is_cancelled {
            return Err(OrderError::AlreadyCancelled);
        }

        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(OrderError::EmptyReason);
        }

        let order_id = self.id.expect("cancel on an order that was never created");
        Ok(vec![OrderEvent::order_cancelled(
            order_id, reason, occurred_at,
        )])
    }
}
