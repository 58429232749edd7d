//! Order domain events.
//!
//! The enum is closed: the aggregate's fold and every projection match on
//! it exhaustively, so adding an event kind is a compile-checked change
//! everywhere it must be handled. Timestamps come from the caller, which
//! keeps replay deterministic and lets tests pin time.

use chrono::{DateTime, Utc};
use common::StreamId;
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{CustomerId, ItemId};

/// Events that can occur on an order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order was created.
    OrderCreated(OrderCreatedData),

    /// An item was added to the order.
    OrderItemAdded(OrderItemAddedData),

    /// Order was shipped.
    OrderShipped(OrderShippedData),

    /// Order was cancelled.
    OrderCancelled(OrderCancelledData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "OrderCreated",
            OrderEvent::OrderItemAdded(_) => "OrderItemAdded",
            OrderEvent::OrderShipped(_) => "OrderShipped",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(data) => data.occurred_at,
            OrderEvent::OrderItemAdded(data) => data.occurred_at,
            OrderEvent::OrderShipped(data) => data.occurred_at,
            OrderEvent::OrderCancelled(data) => data.occurred_at,
        }
    }
}

/// Data for OrderCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    /// The order (stream) ID.
    pub order_id: StreamId,

    /// The customer who placed the order.
    pub customer_id: CustomerId,

    /// Free-text order description.
    pub description: String,

    /// When the order was created.
    pub occurred_at: DateTime<Utc>,
}

/// Data for OrderItemAdded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemAddedData {
    /// The order the item was added to.
    pub order_id: StreamId,

    /// The item that was added.
    pub item_id: ItemId,

    /// Item display name at the time of adding.
    pub item_name: String,

    /// Quantity added.
    pub quantity: u32,

    /// When the item was added.
    pub occurred_at: DateTime<Utc>,
}

/// Data for OrderShipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShippedData {
    /// The order that shipped.
    pub order_id: StreamId,

    /// When the order shipped.
    pub occurred_at: DateTime<Utc>,
}

/// Data for OrderCancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    /// The order that was cancelled.
    pub order_id: StreamId,

    /// Reason for cancellation.
    pub reason: String,

    /// When the order was cancelled.
    pub occurred_at: DateTime<Utc>,
}

// Convenience constructors; timestamps are always explicit.
impl OrderEvent {
    /// Creates an OrderCreated event.
    pub fn order_created(
        order_id: StreamId,
        customer_id: CustomerId,
        description: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        OrderEvent::OrderCreated(OrderCreatedData {
            order_id,
            customer_id,
            description: description.into(),
            occurred_at,
        })
    }

    /// Creates an OrderItemAdded event.
    pub fn order_item_added(
        order_id: StreamId,
        item_id: ItemId,
        item_name: impl Into<String>,
        quantity: u32,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        OrderEvent::OrderItemAdded(OrderItemAddedData {
            order_id,
            item_id,
            item_name: item_name.into(),
            quantity,
            occurred_at,
        })
    }

    /// Creates an OrderShipped event.
    pub fn order_shipped(order_id: StreamId, occurred_at: DateTime<Utc>) -> Self {
        OrderEvent::OrderShipped(OrderShippedData {
            order_id,
            occurred_at,
        })
    }

    /// Creates an OrderCancelled event.
    pub fn order_cancelled(
        order_id: StreamId,
        reason: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        OrderEvent::OrderCancelled(OrderCancelledData {
            order_id,
            reason: reason.into(),
            occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names() {
        let order_id = StreamId::new();
        let at = Utc::now();

        let event = OrderEvent::order_created(order_id, CustomerId::new(), "test", at);
        assert_eq!(event.event_type(), "OrderCreated");

        let event = OrderEvent::order_item_added(order_id, ItemId::new(), "Widget", 2, at);
        assert_eq!(event.event_type(), "OrderItemAdded");

        let event = OrderEvent::order_shipped(order_id, at);
        assert_eq!(event.event_type(), "OrderShipped");

        let event = OrderEvent::order_cancelled(order_id, "changed mind", at);
        assert_eq!(event.event_type(), "OrderCancelled");
    }

    #[test]
    fn occurred_at_is_the_caller_supplied_timestamp() {
        let at = "2024-03-01T12:00:00Z".parse().unwrap();
        let event = OrderEvent::order_shipped(StreamId::new(), at);
        assert_eq!(event.occurred_at(), at);
    }

    #[test]
    fn events_roundtrip_through_json() {
        let order_id = StreamId::new();
        let item_id = ItemId::new();
        let at = Utc::now();
        let event = OrderEvent::order_item_added(order_id, item_id, "Widget", 3, at);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("OrderItemAdded"));

        let back: OrderEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn cancelled_event_carries_reason() {
        let event = OrderEvent::order_cancelled(StreamId::new(), "out of stock", Utc::now());
        let json = serde_json::to_string(&event).unwrap();
        let back: OrderEvent = serde_json::from_str(&json).unwrap();

        match back {
            OrderEvent::OrderCancelled(data) => assert_eq!(data.reason, "out of stock"),
            other => panic!("expected OrderCancelled, got {:?}", other.event_type()),
        }
    }
}
