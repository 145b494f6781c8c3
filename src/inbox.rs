//! Inbox Service: authenticated read and acknowledge access to a local agent's pulled
//! messages.

use crate::domain_types::{Address, MessageId};
use crate::error::ErrorKind;
use crate::model::Message;
use crate::registry::{ApiKeyVerifier, RegistryError};
use crate::storage::{Storage, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by the Inbox Service.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("missing authorization header")]
    MissingAuthorization,

    #[error("empty API key")]
    EmptyApiKey,

    #[error("access denied")]
    AccessDenied,

    #[error("message not found")]
    MessageNotFound,

    #[error("message not in inbox")]
    MessageNotInInbox,

    #[error("already acknowledged")]
    AlreadyAcknowledged,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl InboxError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingAuthorization | Self::EmptyApiKey | Self::AccessDenied => ErrorKind::AccessDenied,
            Self::MessageNotFound => ErrorKind::MessageNotFound,
            Self::MessageNotInInbox => ErrorKind::MessageNotInInbox,
            Self::AlreadyAcknowledged => ErrorKind::AlreadyAcknowledged,
            Self::Registry(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

type InboxResult<T> = Result<T, InboxError>;

/// Authenticated read/acknowledge access over `Storage`'s inbox operations.
pub struct InboxService {
    storage: Arc<dyn Storage>,
    registry: Arc<dyn ApiKeyVerifier>,
}

impl InboxService {
    /// Builds an inbox service over the given storage and API-key verifier.
    pub fn new(storage: Arc<dyn Storage>, registry: Arc<dyn ApiKeyVerifier>) -> Self {
        Self { storage, registry }
    }

    fn authenticate(&self, recipient: &Address, api_key: Option<&str>) -> InboxResult<()> {
        let Some(api_key) = api_key else {
            return Err(InboxError::MissingAuthorization);
        };
        if api_key.is_empty() {
            return Err(InboxError::EmptyApiKey);
        }
        if !self.registry.verify_api_key(recipient, api_key) {
            return Err(InboxError::AccessDenied);
        }
        Ok(())
    }

    /// Returns every undelivered-to-app message for `recipient`.
    ///
    /// # Errors
    ///
    /// `MissingAuthorization`/`EmptyApiKey`/`AccessDenied` on auth failure; propagates storage
    /// failures otherwise.
    pub async fn get_inbox(&self, recipient: &Address, api_key: Option<&str>) -> InboxResult<Vec<Message>> {
        self.authenticate(recipient, api_key)?;
        let messages = self.storage.get_inbox_messages(recipient).await?;
        debug!(%recipient, message_count = messages.len(), "inbox fetched");
        self.registry.touch_last_access(recipient).await?;
        Ok(messages)
    }

    /// Acknowledges receipt of `message_id` by `recipient`.
    ///
    /// # Errors
    ///
    /// `MissingAuthorization`/`EmptyApiKey`/`AccessDenied` on auth failure; `MessageNotFound`,
    /// `MessageNotInInbox`, or `AlreadyAcknowledged` on a state mismatch.
    pub async fn acknowledge_message(
        &self,
        recipient: &Address,
        api_key: Option<&str>,
        message_id: MessageId,
    ) -> InboxResult<()> {
        self.authenticate(recipient, api_key)?;
        self.storage
            .acknowledge_message(recipient, message_id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => InboxError::MessageNotFound,
                StorageError::Validation(reason) if reason.contains("already") => InboxError::AlreadyAcknowledged,
                StorageError::Validation(_) => InboxError::MessageNotInInbox,
                other => other.into(),
            })
            .inspect_err(|e| warn!(%recipient, %message_id, error = %e, "acknowledge rejected"))?;
        debug!(%recipient, %message_id, "message acknowledged");
        self.registry.touch_last_access(recipient).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::StorageCapacity;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;

    struct StubVerifier {
        key: &'static str,
    }

    #[async_trait]
    impl ApiKeyVerifier for StubVerifier {
        fn verify_api_key(&self, _address: &Address, key: &str) -> bool {
            key == self.key
        }

        async fn touch_last_access(&self, _address: &Address) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_authorization_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageCapacity::try_new(10).unwrap()));
        let registry: Arc<dyn ApiKeyVerifier> = Arc::new(StubVerifier { key: "secret" });
        let inbox = InboxService::new(storage, registry);
        let recipient = Address::try_new("a@example.com").unwrap();
        assert!(matches!(
            inbox.get_inbox(&recipient, None).await,
            Err(InboxError::MissingAuthorization)
        ));
    }

    #[tokio::test]
    async fn wrong_key_is_denied() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new(StorageCapacity::try_new(10).unwrap()));
        let registry: Arc<dyn ApiKeyVerifier> = Arc::new(StubVerifier { key: "secret" });
        let inbox = InboxService::new(storage, registry);
        let recipient = Address::try_new("a@example.com").unwrap();
        assert!(matches!(
            inbox.get_inbox(&recipient, Some("wrong")).await,
            Err(InboxError::AccessDenied)
        ));
    }
}
