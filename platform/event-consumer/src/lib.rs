//! # Event Consumer
//!
//! Consumer side of the broker plumbing in `event-bus`:
//!
//! - [`ResilientConsumer`]: consumes one queue, settles each delivery according
//!   to the [`MessageHandler`] outcome and reconnects after a broker drop
//! - [`WorkerManager`]: starts, stops and reports on a set of consumers
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use event_bus::{ConsumerConfig, Delivery, InMemoryBroker};
//! use event_consumer::{ConsumerDefinition, HandlerError, MessageHandler, WorkerManager, WorkerSettings};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn handle(&self, message: &serde_json::Value, _: &Delivery) -> Result<(), HandlerError> {
//!         println!("{message}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = WorkerManager::new(
//!     WorkerSettings { enabled: true, broker_url: "memory://".to_string() },
//!     Arc::new(InMemoryBroker::new()),
//!     vec![ConsumerDefinition::new(ConsumerConfig::new("printer", "jobs"), Arc::new(Printer))],
//! )?;
//! manager.start().await?;
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod handler;
mod worker_manager;

pub use consumer::{ConsumerCounters, ConsumerError, ConsumerStatus, ResilientConsumer};
pub use handler::{HandlerError, MessageHandler};
pub use worker_manager::{
    ConsumerDefinition, ManagerError, ManagerStatus, WorkerManager, WorkerSettings,
};
