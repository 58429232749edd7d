//! Order service: the per-command entry points exposed to callers.

use common::StreamId;
use event_store::EventStore;

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{AddOrderItem, CancelOrder, CreateOrder, Order, ShipOrder};

impl From<super::OrderError> for DomainError {
    fn from(e: super::OrderError) -> Self {
        DomainError::Order(e)
    }
}

/// High-level API for order commands, wrapping the command handler.
///
/// One method per use case; aggregate validation errors propagate to the
/// caller unchanged, classified via [`DomainError::kind`].
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
}

impl<S: EventStore> OrderService<S> {
    /// Creates a new order service over the given event store.
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    /// Returns a reference to the underlying command handler.
    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    /// Creates a new order; fails with `AlreadyExists` when the stream has
    /// already been started.
    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id))]
    pub async fn create_order(
        &self,
        cmd: CreateOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .execute_new(cmd.order_id, |order| {
                order.create(cmd.order_id, cmd.customer_id, cmd.description, cmd.occurred_at)
            })
            .await
    }

    /// Adds an item to an existing order.
    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id, item_id = %cmd.item_id))]
    pub async fn add_item(&self, cmd: AddOrderItem) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .execute_with_snapshot(cmd.order_id, |order| {
                order.add_item(cmd.item_id, cmd.item_name, cmd.quantity, cmd.occurred_at)
            })
            .await
    }

    /// Marks an order as shipped.
    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id))]
    pub async fn ship_order(&self, cmd: ShipOrder) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .execute_with_snapshot(cmd.order_id, |order| order.ship(cmd.occurred_at))
            .await
    }

    /// Cancels an order.
    #[tracing::instrument(skip(self), fields(order_id = %cmd.order_id))]
    pub async fn cancel_order(
        &self,
        cmd: CancelOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.handler
            .execute_with_snapshot(cmd.order_id, |order| {
                order.cancel(cmd.reason, cmd.occurred_at)
            })
            .await
    }

    /// Loads an order by ID, or None if it doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: StreamId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }
}
