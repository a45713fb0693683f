//! moustique_broker
//!
//! The broker crate contains the per-tenant message broker (subscription
//! table, per-client message queues, the pickup/kick lifecycle, poster
//! statistics, system messages and the last-value store glue) plus the
//! tenant manager that owns one fully isolated broker per authenticated
//! identity.
//!
//! Public types:
//! - `Broker`: core engine for subscribe/publish/pickup and value lookups.
//! - `BrokerManager`: lazy per-tenant broker creation, snapshot coordination
//!   and shutdown.
//!
//! This crate is used by the HTTP transport crate and the server binary; it
//! does no network I/O of its own.

pub mod engine;
pub mod error;
pub mod manager;
pub mod message;
pub mod topic;

pub use engine::{Broker, BrokerOptions, BrokerStats, UsageSummary};
pub use error::BrokerError;
pub use manager::{BrokerManager, ManagerError};
pub use message::{Client, Message, Provider};

#[cfg(test)]
mod tests;
