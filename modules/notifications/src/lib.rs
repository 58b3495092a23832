//! Shopping-list notification worker
//!
//! Consumes list and user events from the broker and turns them into emails.

pub mod config;
pub mod consumer_tasks;
pub mod email;
pub mod handlers;
pub mod models;
pub mod ports;
pub mod repositories;

pub use config::{BrokerType, Config};
pub use handlers::{DispatchError, DispatchReport, NotificationHandler};
pub use models::{EventKind, NotificationEvent};
