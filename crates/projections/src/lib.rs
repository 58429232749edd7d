//! Query side of the order engine.
//!
//! Three read models are derived from the event log: an order summary per
//! order (applied inline with the commit), product sales per item sliced
//! across every order stream, and an append-only per-event timeline. The
//! [`ProjectionDaemon`] catches asynchronous shards up past their
//! checkpoints and rebuilds any read model from the full log; the
//! [`ProjectionHealthMonitor`] watches shard lag and triggers rebuilds.

pub mod daemon;
pub mod error;
pub mod monitor;
pub mod queries;
pub mod views;

pub use daemon::{ProjectionDaemon, ProjectionStatus};
pub use error::{ProjectionError, Result};
pub use monitor::{ProjectionHealthMonitor, ShardHealth};
pub use queries::ReadModelQueries;
pub use views::{
    OrderSummary, OrderSummaryProjection, OrderTimelineEntry, OrderTimelineProjection,
    ProductSales, ProductSalesProjection,
};
