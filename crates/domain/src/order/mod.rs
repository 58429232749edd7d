//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod value_objects;

pub use aggregate::Order;
pub use commands::{AddOrderItem, CancelOrder, CreateOrder, ShipOrder};
pub use events::{
    OrderCancelledData, OrderCreatedData, OrderEvent, OrderItemAddedData, OrderShippedData,
};
pub use service::OrderService;
pub use value_objects::{CustomerId, ItemId, OrderLine};

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors the order aggregate's behavior methods can produce.
///
/// Every variant is raised before any event is produced; a failed call
/// leaves the aggregate unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    /// Cannot modify order - already shipped.
    #[error("cannot modify order - already shipped")]
    AlreadyShipped,

    /// Cannot modify order - already cancelled.
    #[error("cannot modify order - already cancelled")]
    AlreadyCancelled,

    /// Order already created.
    #[error("order already created")]
    AlreadyCreated,

    /// Cannot cancel a shipped order.
    #[error("cannot cancel a shipped order")]
    CannotCancelShipped,

    /// Quantity must be greater than zero.
    #[error("quantity must be greater than zero (got {quantity})")]
    InvalidQuantity { quantity: u32 },

    /// Description cannot be empty.
    #[error("description cannot be empty")]
    EmptyDescription,

    /// Item name cannot be empty.
    #[error("item name cannot be empty")]
    EmptyItemName,

    /// Cancellation reason is required.
    #[error("cancellation reason is required")]
    EmptyReason,
}

impl OrderError {
    /// Classifies the error: bad input vs. a state precondition failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidQuantity { .. }
            | OrderError::EmptyDescription
            | OrderError::EmptyItemName
            | OrderError::EmptyReason => ErrorKind::Validation,
            OrderError::AlreadyShipped
            | OrderError::AlreadyCancelled
            | OrderError::AlreadyCreated
            | OrderError::CannotCancelShipped => ErrorKind::Conflict,
        }
    }
}
