//! SQLite-backed `Storage`, following the functional-core/imperative-shell split used
//! throughout this crate's database layer: pure SQL text and row mapping live in `sql`/
//! `mapping`, I/O lives on `RelationalStorage` itself.
//!
//! Every multi-table mutation runs inside one transaction; `update_status` reads, calls the
//! supplied updater, and writes back in the same transaction, so callers may treat it as
//! serialised per message id.

use super::{MessageFilter, Storage, StorageError, StorageResult, StorageStats, StatusUpdater};
use crate::database::DatabaseConnection;
use crate::domain_types::{Address, MessageId, SchemaName};
use crate::model::{DeliveryStatus, LocalAgent, Message, MessageStatus};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, trace};

mod sql {
    pub(super) fn select_message_by_id() -> &'static str {
        "SELECT body FROM messages WHERE id = ?"
    }

    pub(super) fn insert_message() -> &'static str {
        "INSERT INTO messages (id, sender, created_at, body) VALUES (?, ?, ?, ?)"
    }

    pub(super) fn delete_message() -> &'static str {
        "DELETE FROM messages WHERE id = ?"
    }

    pub(super) fn delete_status() -> &'static str {
        "DELETE FROM message_statuses WHERE message_id = ?"
    }

    pub(super) fn select_status_by_id() -> &'static str {
        "SELECT body FROM message_statuses WHERE message_id = ?"
    }

    pub(super) fn upsert_status() -> &'static str {
        "INSERT INTO message_statuses (message_id, overall_status, body) VALUES (?, ?, ?)
         ON CONFLICT(message_id) DO UPDATE SET overall_status = excluded.overall_status, body = excluded.body"
    }

    pub(super) fn list_messages_base() -> &'static str {
        "SELECT body FROM messages ORDER BY created_at DESC"
    }

    pub(super) fn select_agent() -> &'static str {
        "SELECT body FROM agents WHERE address = ?"
    }

    pub(super) fn insert_agent() -> &'static str {
        "INSERT INTO agents (address, body) VALUES (?, ?)"
    }

    pub(super) fn update_agent() -> &'static str {
        "UPDATE agents SET body = ? WHERE address = ?"
    }

    pub(super) fn delete_agent() -> &'static str {
        "DELETE FROM agents WHERE address = ?"
    }

    pub(super) fn select_all_agents() -> &'static str {
        "SELECT body FROM agents"
    }

    pub(super) fn delete_recipient_statuses() -> &'static str {
        "DELETE FROM recipient_statuses WHERE message_id = ?"
    }

    pub(super) fn insert_recipient_status() -> &'static str {
        "INSERT INTO recipient_statuses
            (message_id, address, local_delivery, inbox_delivered, acknowledged, body)
         VALUES (?, ?, ?, ?, ?, ?)"
    }

    pub(super) fn select_inbox_message_ids() -> &'static str {
        "SELECT message_id FROM recipient_statuses
         WHERE address = ? AND local_delivery = 1 AND inbox_delivered = 1 AND acknowledged = 0"
    }
}

mod mapping {
    use super::{Message, MessageStatus, StorageError, StorageResult};
    use crate::model::LocalAgent;

    pub(super) fn encode_message(message: &Message) -> StorageResult<String> {
        serde_json::to_string(message).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn decode_message(body: &str) -> StorageResult<Message> {
        serde_json::from_str(body).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn encode_status(status: &MessageStatus) -> StorageResult<String> {
        serde_json::to_string(status).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn decode_status(body: &str) -> StorageResult<MessageStatus> {
        serde_json::from_str(body).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn encode_agent(agent: &LocalAgent) -> StorageResult<String> {
        serde_json::to_string(agent).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn decode_agent(body: &str) -> StorageResult<LocalAgent> {
        serde_json::from_str(body).map_err(|e| StorageError::Internal(e.into()))
    }

    pub(super) fn encode_recipient_status(status: &crate::model::RecipientStatus) -> StorageResult<String> {
        serde_json::to_string(status).map_err(|e| StorageError::Internal(e.into()))
    }
}

/// `Storage` implementation over a SQLite database reached through a pooled
/// [`DatabaseConnection`].
pub struct RelationalStorage {
    connection: DatabaseConnection,
}

impl RelationalStorage {
    /// Wraps an already-initialised connection (migrations already applied).
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    async fn begin(&self) -> StorageResult<Transaction<'_, Sqlite>> {
        self.connection
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Internal(e.into()))
    }

    /// Replaces every `recipient_statuses` row for `message_id` with the rows implied by
    /// `status.recipient_statuses`, keeping the indexed table in sync with the JSON status blob.
    async fn write_recipient_statuses(
        tx: &mut Transaction<'_, Sqlite>,
        message_id: MessageId,
        status: &MessageStatus,
    ) -> StorageResult<()> {
        sqlx::query(sql::delete_recipient_statuses())
            .bind(message_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        for recipient in &status.recipient_statuses {
            let body = mapping::encode_recipient_status(recipient)?;
            sqlx::query(sql::insert_recipient_status())
                .bind(message_id.to_string())
                .bind(recipient.address.to_string())
                .bind(recipient.local_delivery)
                .bind(recipient.inbox_delivered)
                .bind(recipient.acknowledged)
                .bind(body)
                .execute(&mut **tx)
                .await
                .map_err(|e| StorageError::Internal(e.into()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for RelationalStorage {
    async fn store_message(&self, message: Message, initial_status: MessageStatus) -> StorageResult<()> {
        let body = mapping::encode_message(&message)?;
        let status_body = mapping::encode_status(&initial_status)?;
        let mut tx = self.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(sql::select_message_by_id())
            .bind(message.message_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if existing.is_some() {
            return Err(StorageError::AlreadyExists(message.message_id.to_string()));
        }

        sqlx::query(sql::insert_message())
            .bind(message.message_id.to_string())
            .bind(message.sender.to_string())
            .bind(message.timestamp.timestamp())
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        sqlx::query(sql::upsert_status())
            .bind(message.message_id.to_string())
            .bind(status_to_text(initial_status.overall_status))
            .bind(status_body)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        Self::write_recipient_statuses(&mut tx, message.message_id, &initial_status).await?;

        tx.commit().await.map_err(|e| StorageError::Internal(e.into()))?;
        trace!(message_id = %message.message_id, "message stored");
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> StorageResult<Message> {
        let pool = self.connection.pool();
        let row = sqlx::query(sql::select_message_by_id())
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?
            .ok_or(StorageError::NotFound)?;
        let body: String = row.get("body");
        mapping::decode_message(&body)
    }

    async fn delete_message(&self, id: MessageId) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(sql::delete_message())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        sqlx::query(sql::delete_status())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        sqlx::query(sql::delete_recipient_statuses())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        tx.commit().await.map_err(|e| StorageError::Internal(e.into()))?;
        trace!(message_id = %id, "message deleted");
        Ok(())
    }

    async fn list_messages(&self, filter: MessageFilter) -> StorageResult<Vec<Message>> {
        let pool = self.connection.pool();
        let rows = sqlx::query(sql::list_messages_base())
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        let mut matched = Vec::new();
        for row in rows {
            let body: String = row.get("body");
            let message = mapping::decode_message(&body)?;
            if let Some(sender) = &filter.sender {
                if &message.sender != sender {
                    continue;
                }
            }
            if let Some(recipient) = &filter.recipient {
                if !message.recipients.contains(recipient) {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if message.timestamp < since {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                match self.get_status(message.message_id).await {
                    Ok(s) if s.overall_status == status => {}
                    _ => continue,
                }
            }
            matched.push(message);
        }

        let limit = if filter.limit == 0 { matched.len() } else { filter.limit };
        Ok(matched.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn get_status(&self, id: MessageId) -> StorageResult<MessageStatus> {
        let pool = self.connection.pool();
        let row = sqlx::query(sql::select_status_by_id())
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?
            .ok_or(StorageError::NotFound)?;
        let body: String = row.get("body");
        mapping::decode_status(&body)
    }

    async fn store_status(&self, id: MessageId, status: MessageStatus) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let existing: Option<String> = sqlx::query_scalar(sql::select_status_by_id())
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if existing.is_none() {
            return Err(StorageError::NotFound);
        }
        let body = mapping::encode_status(&status)?;
        sqlx::query(sql::upsert_status())
            .bind(id.to_string())
            .bind(status_to_text(status.overall_status))
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        Self::write_recipient_statuses(&mut tx, id, &status).await?;
        tx.commit().await.map_err(|e| StorageError::Internal(e.into()))?;
        Ok(())
    }

    async fn update_status(&self, id: MessageId, updater: StatusUpdater) -> StorageResult<MessageStatus> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(sql::select_status_by_id())
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?
            .ok_or(StorageError::NotFound)?;
        let body: String = row.get("body");
        let current = mapping::decode_status(&body)?;
        let updated = updater(current);
        let updated_body = mapping::encode_status(&updated)?;

        sqlx::query(sql::upsert_status())
            .bind(id.to_string())
            .bind(status_to_text(updated.overall_status))
            .bind(updated_body)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        Self::write_recipient_statuses(&mut tx, id, &updated).await?;
        tx.commit().await.map_err(|e| StorageError::Internal(e.into()))?;
        debug!(message_id = %id, overall_status = ?updated.overall_status, "message status updated");
        Ok(updated)
    }

    async fn get_inbox_messages(&self, recipient: &Address) -> StorageResult<Vec<Message>> {
        let pool = self.connection.pool();
        let rows = sqlx::query(sql::select_inbox_message_ids())
            .bind(recipient.to_string())
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: String = row.get("message_id");
            let message_id = message_id
                .parse::<uuid::Uuid>()
                .ok()
                .and_then(|uuid| MessageId::try_from(uuid).ok())
                .ok_or_else(|| StorageError::Internal(anyhow::anyhow!("malformed message id in recipient_statuses")))?;
            result.push(self.get_message(message_id).await?);
        }
        Ok(result)
    }

    async fn acknowledge_message(&self, recipient: &Address, id: MessageId) -> StorageResult<()> {
        let recipient = recipient.clone();
        self.update_status(
            id,
            Box::new(move |mut status| {
                if let Some(r) = status.recipient_statuses.iter_mut().find(|r| r.address == recipient) {
                    r.acknowledged = true;
                    r.acknowledged_at = Some(chrono::Utc::now());
                }
                status
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_stats(&self) -> StorageResult<StorageStats> {
        let pool = self.connection.pool();
        let rows = sqlx::query("SELECT overall_status, COUNT(*) as n FROM message_statuses GROUP BY overall_status")
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;

        let mut stats = StorageStats::default();
        for row in rows {
            let status: String = row.get("overall_status");
            let n: i64 = row.get("n");
            let n = n as u64;
            stats.total_messages += n;
            match status.as_str() {
                "pending" | "queued" => stats.pending += n,
                "delivering" | "retrying" => stats.delivering += n,
                "delivered" => stats.delivered += n,
                "failed" => stats.failed += n,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn create_agent(&self, agent: LocalAgent) -> StorageResult<()> {
        let pool = self.connection.pool();
        let existing: Option<String> = sqlx::query_scalar(sql::select_agent())
            .bind(agent.address.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if existing.is_some() {
            return Err(StorageError::AlreadyExists(agent.address.to_string()));
        }
        let body = mapping::encode_agent(&agent)?;
        sqlx::query(sql::insert_agent())
            .bind(agent.address.to_string())
            .bind(body)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        Ok(())
    }

    async fn get_agent(&self, address: &Address) -> StorageResult<LocalAgent> {
        let pool = self.connection.pool();
        let row = sqlx::query(sql::select_agent())
            .bind(address.to_string())
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?
            .ok_or(StorageError::NotFound)?;
        let body: String = row.get("body");
        mapping::decode_agent(&body)
    }

    async fn update_agent(&self, agent: LocalAgent) -> StorageResult<()> {
        let pool = self.connection.pool();
        let body = mapping::encode_agent(&agent)?;
        let result = sqlx::query(sql::update_agent())
            .bind(body)
            .bind(agent.address.to_string())
            .execute(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn delete_agent(&self, address: &Address) -> StorageResult<()> {
        let pool = self.connection.pool();
        let result = sqlx::query(sql::delete_agent())
            .bind(address.to_string())
            .execute(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn list_agents(&self) -> StorageResult<Vec<LocalAgent>> {
        let pool = self.connection.pool();
        let rows = sqlx::query(sql::select_all_agents())
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::Internal(e.into()))?;
        rows.into_iter()
            .map(|row| {
                let body: String = row.get("body");
                mapping::decode_agent(&body)
            })
            .collect()
    }

    async fn get_supported_schemas(&self) -> StorageResult<Vec<SchemaName>> {
        let mut schemas: Vec<SchemaName> = self
            .list_agents()
            .await?
            .into_iter()
            .flat_map(|a| a.supported_schemas)
            .collect();
        schemas.sort();
        schemas.dedup();
        Ok(schemas)
    }
}

fn status_to_text(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Queued => "queued",
        DeliveryStatus::Delivering => "delivering",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Retrying => "retrying",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use crate::storage::test_support::{initial_status, sample_message};

    async fn store() -> RelationalStorage {
        let dir = tempfile::tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let connection = DatabaseConnection::initialize(config).await.unwrap();
        std::mem::forget(dir);
        RelationalStorage::new(connection)
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let storage = store().await;
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status).await.unwrap();
        let fetched = storage.get_message(message.message_id).await.unwrap();
        assert_eq!(fetched, message);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_rejected() {
        let storage = store().await;
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status.clone()).await.unwrap();
        assert!(matches!(
            storage.store_message(message, status).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn delete_then_get_yields_not_found() {
        let storage = store().await;
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
    async fn inbox_query_reflects_recipient_statuses_table() {
        let storage = store().await;
        let message = sample_message("a@example.com", &["b@example.com"]);
        let status = initial_status(&message);
        storage.store_message(message.clone(), status).await.unwrap();
        let recipient = Address::try_new("b@example.com").unwrap();

        assert!(storage.get_inbox_messages(&recipient).await.unwrap().is_empty());

        storage
            .update_status(
                message.message_id,
                Box::new(|mut status| {
                    for r in &mut status.recipient_statuses {
                        r.local_delivery = true;
                        r.inbox_delivered = true;
                    }
                    status
                }),
            )
            .await
            .unwrap();

        let inbox = storage.get_inbox_messages(&recipient).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_id, message.message_id);

        storage.acknowledge_message(&recipient, message.message_id).await.unwrap();
        assert!(storage.get_inbox_messages(&recipient).await.unwrap().is_empty());
    }
}
