//! Storage abstraction: a uniform interface over an in-memory backing and a relational one.
//!
//! Both backings honour the same lock/transaction ordering invariant — messages before
//! statuses — and the same atomicity guarantees on `StoreMessage`/`DeleteMessage`.

mod memory;
mod relational;

pub use memory::InMemoryStorage;
pub use relational::RelationalStorage;

use crate::domain_types::{Address, MessageId, SchemaName};
use crate::error::ErrorKind;
use crate::model::{DeliveryStatus, LocalAgent, Message, MessageStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by any `Storage` implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("capacity exceeded")]
    CapacityExceeded,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal storage error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StorageError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::MessageNotFound,
            Self::AlreadyExists(_) => ErrorKind::ValidationFailed,
            Self::CapacityExceeded => ErrorKind::CapacityExceeded,
            Self::Validation(_) => ErrorKind::ValidationFailed,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result alias used throughout the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

/// Filter predicate accepted by `ListMessages`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub sender: Option<Address>,
    pub recipient: Option<Address>,
    pub status: Option<DeliveryStatus>,
    pub since: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

/// Aggregate counts by terminal status, as returned by `GetStats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    pub total_messages: u64,
    pub pending: u64,
    pub delivering: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// A closure that reads the current status and returns the updated one, used by `UpdateStatus`.
pub type StatusUpdater = Box<dyn FnOnce(MessageStatus) -> MessageStatus + Send>;

/// Persistence for messages, their delivery status, and locally registered agents.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Inserts `message` and its initial pending status atomically.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if `message.message_id` is already stored; `CapacityExceeded` if the
    /// backing is at its configured cap.
    async fn store_message(&self, message: Message, initial_status: MessageStatus) -> StorageResult<()>;

    /// Reads a message by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such message exists.
    async fn get_message(&self, id: MessageId) -> StorageResult<Message>;

    /// Deletes a message and its status atomically.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such message exists.
    async fn delete_message(&self, id: MessageId) -> StorageResult<()>;

    /// Lists messages matching `filter`, ordered by creation time descending.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` on a backend failure.
    async fn list_messages(&self, filter: MessageFilter) -> StorageResult<Vec<Message>>;

    /// Reads the aggregate status for a message.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such message exists.
    async fn get_status(&self, id: MessageId) -> StorageResult<MessageStatus>;

    /// Replaces the aggregate status for a message wholesale.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such message exists.
    async fn store_status(&self, id: MessageId, status: MessageStatus) -> StorageResult<()>;

    /// Read-modify-write of a message's status, serialised per `id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such message exists.
    async fn update_status(&self, id: MessageId, updater: StatusUpdater) -> StorageResult<MessageStatus>;

    /// Every message whose status for `recipient` satisfies
    /// `local_delivery ∧ inbox_delivered ∧ ¬acknowledged`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` on a backend failure.
    async fn get_inbox_messages(&self, recipient: &Address) -> StorageResult<Vec<Message>>;

    /// Marks `recipient`'s status for `id` acknowledged.
    ///
    /// # Errors
    ///
    /// `NotFound` if the message is absent; `Validation` if the recipient's status is not
    /// inbox-delivered or is already acknowledged.
    async fn acknowledge_message(&self, recipient: &Address, id: MessageId) -> StorageResult<()>;

    /// Aggregate counts by terminal status.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` on a backend failure.
    async fn get_stats(&self) -> StorageResult<StorageStats>;

    /// Registers a new local agent.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if `agent.address` is already registered.
    async fn create_agent(&self, agent: LocalAgent) -> StorageResult<()>;

    /// Reads a local agent by address.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such agent exists.
    async fn get_agent(&self, address: &Address) -> StorageResult<LocalAgent>;

    /// Replaces a local agent's record wholesale.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such agent exists.
    async fn update_agent(&self, agent: LocalAgent) -> StorageResult<()>;

    /// Deletes a local agent.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such agent exists.
    async fn delete_agent(&self, address: &Address) -> StorageResult<()>;

    /// Lists every registered local agent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` on a backend failure.
    async fn list_agents(&self) -> StorageResult<Vec<LocalAgent>>;

    /// The union of every registered agent's supported-schema list.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Internal` on a backend failure.
    async fn get_supported_schemas(&self) -> StorageResult<Vec<SchemaName>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain_types::IdempotencyKey;
    use crate::model::DeliveryMode;
    use std::collections::HashMap;

    pub fn sample_message(sender: &str, recipients: &[&str]) -> Message {
        Message::accept(
            IdempotencyKey::generate(),
            Address::try_new(sender).unwrap(),
            recipients
                .iter()
                .map(|r| Address::try_new(*r).unwrap())
                .collect(),
            Some("test".to_string()),
            None,
            HashMap::new(),
            b"payload".to_vec(),
            None,
        )
        .unwrap()
    }

    pub fn initial_status(message: &Message) -> MessageStatus {
        MessageStatus::initial(message.message_id, &message.recipients, DeliveryMode::Pull)
    }
}
