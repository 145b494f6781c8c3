//! `dashmap`-backed in-memory `Storage`, bounded by a configured message-count cap.
//!
//! Multi-map operations lock messages before statuses, matching the relational backend's
//! transaction ordering so neither backing can deadlock against the other's lock discipline.

use super::{MessageFilter, Storage, StorageError, StorageResult, StorageStats, StatusUpdater};
use crate::domain_types::{Address, MessageId, SchemaName, StorageCapacity};
use crate::model::{DeliveryStatus, LocalAgent, Message};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{trace, warn};

/// In-memory `Storage`. Cheap to construct; intended for development and tests, and for
/// single-process deployments willing to lose state on restart.
pub struct InMemoryStorage {
    capacity: StorageCapacity,
    messages: RwLock<DashMap<MessageId, Message>>,
    statuses: RwLock<DashMap<MessageId, crate::model::MessageStatus>>,
    agents: DashMap<Address, LocalAgent>,
    status_locks: DashMap<MessageId, Arc<Mutex<()>>>,
}

impl InMemoryStorage {
    /// Creates an empty store with the given capacity.
    pub fn new(capacity: StorageCapacity) -> Self {
        Self {
            capacity,
            messages: RwLock::new(DashMap::new()),
            statuses: RwLock::new(DashMap::new()),
            agents: DashMap::new(),
            status_locks: DashMap::new(),
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn store_message(
        &self,
        message: Message,
        initial_status: crate::model::MessageStatus,
    ) -> StorageResult<()> {
        let messages = self.messages.write().await;
        if messages.contains_key(&message.message_id) {
            return Err(StorageError::AlreadyExists(message.message_id.to_string()));
        }
        if messages.len() >= self.capacity.as_usize() {
            warn!(capacity = self.capacity.as_usize(), "in-memory storage at capacity");
            return Err(StorageError::CapacityExceeded);
        }
        let statuses = self.statuses.write().await;
        messages.insert(message.message_id, message.clone());
        statuses.insert(message.message_id, initial_status);
        trace!(message_id = %message.message_id, "message stored");
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> StorageResult<Message> {
        let messages = self.messages.read().await;
        messages.get(&id).map(|m| m.clone()).ok_or(StorageError::NotFound)
    }

    async fn delete_message(&self, id: MessageId) -> StorageResult<()> {
        let messages = self.messages.write().await;
        let statuses = self.statuses.write().await;
        if messages.remove(&id).is_none() {
            return Err(StorageError::NotFound);
        }
        statuses.remove(&id);
        self.status_locks.remove(&id);
        trace!(message_id = %id, "message deleted");
        Ok(())
    }

    async fn list_messages(&self, filter: MessageFilter) -> StorageResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let statuses = self.statuses.read().await;
        let mut matched: Vec<Message> = messages
            .iter()
            .filter(|entry| {
                let message = entry.value();
                if let Some(sender) = &filter.sender {
                    if &message.sender != sender {
                        return false;
                    }
                }
                if let Some(recipient) = &filter.recipient {
                    if !message.recipients.contains(recipient) {
                        return false;
                    }
                }
                if let Some(since) = filter.since {
                    if message.timestamp < since {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    match statuses.get(&message.message_id) {
                        Some(s) if s.overall_status == status => {}
                        _ => return false,
                    }
                }
                true
            })
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let limit = if filter.limit == 0 { matched.len() } else { filter.limit };
        Ok(matched.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn get_status(&self, id: MessageId) -> StorageResult<crate::model::MessageStatus> {
        let statuses = self.statuses.read().await;
        statuses.get(&id).map(|s| s.clone()).ok_or(StorageError::NotFound)
    }

    async fn store_status(&self, id: MessageId, status: crate::model::MessageStatus) -> StorageResult<()> {
        let statuses = self.statuses.write().await;
        if !statuses.contains_key(&id) {
            return Err(StorageError::NotFound);
        }
        statuses.insert(id, status);
        Ok(())
    }

    async fn update_status(&self, id: MessageId, updater: StatusUpdater) -> StorageResult<crate::model::MessageStatus> {
        // Clone the Arc and drop the DashMap shard guard before awaiting on the per-id lock;
        // holding a dashmap Ref across an await point would make this future !Send.
        let per_id_lock = self
            .status_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = per_id_lock.lock().await;

        let statuses = self.statuses.write().await;
        let current = statuses.get(&id).map(|s| s.clone()).ok_or(StorageError::NotFound)?;
        let updated = updater(current);
        statuses.insert(id, updated.clone());
        Ok(updated)
    }

    async fn get_inbox_messages(&self, recipient: &Address) -> StorageResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let statuses = self.statuses.read().await;
        let mut result = Vec::new();
        for entry in statuses.iter() {
            let status = entry.value();
            let matches = status.recipient_statuses.iter().any(|r| {
                &r.address == recipient && r.local_delivery && r.inbox_delivered && !r.acknowledged
            });
            if matches {
                if let Some(message) = messages.get(entry.key()) {
                    result.push(message.clone());
                }
            }
        }
        Ok(result)
    }

    async fn acknowledge_message(&self, recipient: &Address, id: MessageId) -> StorageResult<()> {
        let statuses = self.statuses.write().await;
        let mut entry = statuses.get_mut(&id).ok_or(StorageError::NotFound)?;
        let recipient_status = entry
            .recipient_statuses
            .iter_mut()
            .find(|r| &r.address == recipient)
            .ok_or(StorageError::NotFound)?;

        if !recipient_status.local_delivery || !recipient_status.inbox_delivered {
            return Err(StorageError::Validation("message not in inbox".to_string()));
        }
        if recipient_status.acknowledged {
            return Err(StorageError::Validation("already acknowledged".to_string()));
        }
        recipient_status.acknowledged = true;
        recipient_status.acknowledged_at = Some(chrono::Utc::now());
        trace!(%recipient, message_id = %id, "message acknowledged");
        Ok(())
    }

    async fn get_stats(&self) -> StorageResult<StorageStats> {
        let statuses = self.statuses.read().await;
        let mut stats = StorageStats::default();
        for entry in statuses.iter() {
            stats.total_messages += 1;
            match entry.value().overall_status {
                DeliveryStatus::Pending | DeliveryStatus::Queued => stats.pending += 1,
                DeliveryStatus::Delivering | DeliveryStatus::Retrying => stats.delivering += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn create_agent(&self, agent: LocalAgent) -> StorageResult<()> {
        if self.agents.contains_key(&agent.address) {
            return Err(StorageError::AlreadyExists(agent.address.to_string()));
        }
        self.agents.insert(agent.address.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, address: &Address) -> StorageResult<LocalAgent> {
        self.agents.get(address).map(|a| a.clone()).ok_or(StorageError::NotFound)
    }

    async fn update_agent(&self, agent: LocalAgent) -> StorageResult<()> {
        if !self.agents.contains_key(&agent.address) {
            return Err(StorageError::NotFound);
        }
        self.agents.insert(agent.address.clone(), agent);
        Ok(())
    }

    async fn delete_agent(&self, address: &Address) -> StorageResult<()> {
        self.agents.remove(address).map(|_| ()).ok_or(StorageError::NotFound)
    }

    async fn list_agents(&self) -> StorageResult<Vec<LocalAgent>> {
        Ok(self.agents.iter().map(|a| a.value().clone()).collect())
    }

    async fn get_supported_schemas(&self) -> StorageResult<Vec<SchemaName>> {
        let mut schemas: Vec<SchemaName> = self
            .agents
            .iter()
            .flat_map(|a| a.supported_schemas.clone())
            .collect();
        schemas.sort();
        schemas.dedup();
        Ok(schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{initial_status, sample_message};

    fn store() -> InMemoryStorage {
        InMemoryStorage::new(StorageCapacity::try_new(4).unwrap())
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let storage = store();
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status).await.unwrap();
        let fetched = storage.get_message(message.message_id).await.unwrap();
        assert_eq!(fetched, message);
    }

    #[tokio::test]
    async fn delete_then_get_yields_not_found() {
        let storage = store();
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status).await.unwrap();
        storage.delete_message(message.message_id).await.unwrap();
        assert!(matches!(
            storage.get_message(message.message_id).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn capacity_exceeded_when_full() {
        let storage = store();
        for i in 0..4 {
            let message = sample_message("a@example.com", &[&format!("r{i}@example.com")]);
            let status = initial_status(&message);
            storage.store_message(message, status).await.unwrap();
        }
        let overflow = sample_message("a@example.com", &["last@example.com"]);
        let status = initial_status(&overflow);
        assert!(matches!(
            storage.store_message(overflow, status).await,
            Err(StorageError::CapacityExceeded)
        ));
    }

    #[tokio::test]
    async fn acknowledge_requires_inbox_delivered() {
        let storage = store();
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status).await.unwrap();
        let recipient = Address::try_new("b@example.com").unwrap();
        let result = storage.acknowledge_message(&recipient, message.message_id).await;
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn double_acknowledge_is_rejected() {
        let storage = store();
        let message = sample_message("a@example.com", &["b@example.com"]);
        let recipient = Address::try_new("b@example.com").unwrap();
        let mut status = initial_status(&message);
        status.recipient_statuses[0].local_delivery = true;
        status.recipient_statuses[0].inbox_delivered = true;
        storage.store_message(message.clone(), status).await.unwrap();

        storage.acknowledge_message(&recipient, message.message_id).await.unwrap();
        assert!(matches!(
            storage.acknowledge_message(&recipient, message.message_id).await,
            Err(StorageError::Validation(_))
        ));
    }
}
