//! # AMTP Gateway
//!
//! A gateway implementation of the Agent Message Transfer Protocol (AMTP): capability
//! discovery, a retrying delivery engine, an idempotent fan-out processor, a storage
//! abstraction with in-memory and relational backings, and an agent registry with an
//! authenticated inbox.
//!
//! ## Architecture
//!
//! Each component is a trait ([`storage::Storage`], [`discovery::Discovery`],
//! [`delivery::DeliveryEngine`]) with one production implementation and, where useful, a mock
//! for tests. [`processor::MessageProcessor`] wires them together: it gates on idempotency,
//! dispatches per the message's [`model::CoordinationConfig`], and persists the aggregated
//! outcome through a single [`storage::Storage::update_status`] call.
//!
//! ```no_run
//! use amtp_gateway::config::GatewayConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::development();
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;
pub mod delivery;
pub mod discovery;
pub mod domain_types;
pub mod error;
pub mod inbox;
pub mod model;
pub mod processor;
pub mod registry;
pub mod server;
pub mod storage;

pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError};
pub use server::AppState;

// Common imports
pub use ::tracing::{debug, error, info, instrument, warn};
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use std::collections::HashMap;
pub use std::time::Duration;
pub use thiserror::Error;
pub use tokio::time::timeout;
pub use uuid::Uuid;
