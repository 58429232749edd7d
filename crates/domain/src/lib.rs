//! Domain layer for the event-sourced order engine.
//!
//! This crate provides:
//! - [`Aggregate`] and [`DomainEvent`] traits for event-sourced entities
//! - the generic [`CommandHandler`] tying aggregate behavior to the
//!   store's atomic commit (events + outbox + inline projections)
//! - the Order aggregate, its events, commands and [`OrderService`]

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent, SnapshotCapable};
pub use command::{CommandHandler, CommandResult};
pub use error::{DomainError, ErrorKind};
pub use order::{
    AddOrderItem, CancelOrder, CreateOrder, CustomerId, ItemId, Order, OrderError, OrderEvent,
    OrderLine, OrderService, ShipOrder,
};
