//! Message Processor: the idempotency gate, fan-out strategies, and the single path by which
//! a message's status moves from initial write to aggregated outcome.

use crate::delivery::{DeliveryEngine, DeliveryResult};
use crate::domain_types::{Address, IdempotencyKey};
use crate::error::ErrorKind;
use crate::model::{
    CoordinationConfig, DeliveryMode, DeliveryStatus, Message, MessageStatus, RecipientStatus,
};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Errors raised by the Message Processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProcessorError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
        }
    }
}

type ProcessorResult<T> = Result<T, ProcessorError>;

/// Options accepted by `process_message`.
#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    pub immediate_path: bool,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

/// Outcome of one `process_message` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessingResult {
    pub message_id: crate::domain_types::MessageId,
    pub overall_status: DeliveryStatus,
    pub recipient_results: Vec<(Address, DeliveryResult)>,
}

struct IdempotencyEntry {
    result: ProcessingResult,
    recorded_at: DateTime<Utc>,
}

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn evaluate_condition(expression: &str) -> bool {
    match expression {
        "never" => false,
        _ => true,
    }
}

/// Owns the message lifecycle: idempotency gate, fan-out per coordination mode, aggregation,
/// and the single persistence path (initial write before dispatch, one `UpdateStatus` after
/// aggregation).
pub struct MessageProcessor {
    storage: Arc<dyn Storage>,
    delivery: Arc<dyn DeliveryEngine>,
    idempotency: RwLock<DashMap<IdempotencyKey, IdempotencyEntry>>,
}

impl MessageProcessor {
    /// Builds a processor over the given storage and delivery engine.
    pub fn new(storage: Arc<dyn Storage>, delivery: Arc<dyn DeliveryEngine>) -> Self {
        Self {
            storage,
            delivery,
            idempotency: RwLock::new(DashMap::new()),
        }
    }

    /// Evicts every idempotency entry older than 24 hours. Intended to be called periodically.
    pub async fn cleanup_expired_entries(&self) {
        let map = self.idempotency.write().await;
        let now = Utc::now();
        map.retain(|_, entry| now.signed_duration_since(entry.recorded_at).to_std().unwrap_or_default() < IDEMPOTENCY_TTL);
    }

    /// Accepts a message for processing, honouring the idempotency gate and the configured
    /// coordination mode.
    ///
    /// # Errors
    ///
    /// Propagates `Storage` failures encountered while writing the initial or final status.
    pub async fn process_message(
        &self,
        message: Message,
        options: ProcessingOptions,
    ) -> ProcessorResult<ProcessingResult> {
        {
            let map = self.idempotency.read().await;
            if let Some(entry) = map.get(&message.idempotency_key) {
                if Utc::now().signed_duration_since(entry.recorded_at).to_std().unwrap_or_default() < IDEMPOTENCY_TTL {
                    debug!(message_id = %message.message_id, "idempotency hit, returning cached result");
                    return Ok(clone_result(&entry.result));
                }
            }
        }

        debug!(
            message_id = %message.message_id,
            recipient_count = message.recipients.len(),
            "processing message"
        );

        let cancellation = CancellationToken::new();
        let timeout_guard = options.timeout.map(|duration| {
            let token = cancellation.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                token.cancel();
            })
        });

        let delivery_mode = DeliveryMode::Push;
        let initial_status = MessageStatus::initial(message.message_id, &message.recipients, delivery_mode);
        self.storage.store_message(message.clone(), initial_status.clone()).await?;

        let recipient_results = match message.coordination.clone() {
            Some(CoordinationConfig::Sequential { sequence, stop_on_failure }) => {
                self.run_sequential(&cancellation, &message, &sequence, stop_on_failure).await
            }
            Some(CoordinationConfig::Conditional { rules }) => {
                self.run_conditional(&cancellation, &message, &rules).await
            }
            Some(CoordinationConfig::Parallel { .. }) | None => {
                self.run_parallel(&cancellation, &message, &message.recipients).await
            }
        };

        if let Some(guard) = timeout_guard {
            guard.abort();
        }

        let overall_status = aggregate_status(&recipient_results);
        let updated_status = self
            .storage
            .update_status(
                message.message_id,
                Box::new({
                    let recipient_results = recipient_results.clone();
                    move |mut status| {
                        apply_results(&mut status, &recipient_results);
                        status.overall_status = overall_status;
                        status.updated_at = Utc::now();
                        if overall_status == DeliveryStatus::Delivered && status.delivered_at.is_none() {
                            status.delivered_at = Some(status.updated_at);
                        }
                        status
                    }
                }),
            )
            .await?;

        info!(
            message_id = %message.message_id,
            overall_status = ?updated_status.overall_status,
            "message processing complete"
        );

        let result = ProcessingResult {
            message_id: message.message_id,
            overall_status: updated_status.overall_status,
            recipient_results,
        };

        let map = self.idempotency.write().await;
        map.insert(
            message.idempotency_key,
            IdempotencyEntry {
                result: clone_result(&result),
                recorded_at: Utc::now(),
            },
        );

        Ok(result)
    }

    async fn run_parallel(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipients: &[Address],
    ) -> Vec<(Address, DeliveryResult)> {
        self.delivery
            .deliver_batch(cancellation, message, recipients)
            .await
            .into_iter()
            .collect()
    }

    async fn run_sequential(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        sequence: &[Address],
        stop_on_failure: bool,
    ) -> Vec<(Address, DeliveryResult)> {
        let mut results = Vec::with_capacity(sequence.len());
        let mut iter = sequence.iter();
        while let Some(recipient) = iter.next() {
            let result = self.delivery.deliver_message(cancellation, message, recipient).await;
            let failed = result.status == DeliveryStatus::Failed;
            results.push((recipient.clone(), result));
            if failed && stop_on_failure {
                let remaining: Vec<_> = iter.cloned().collect();
                trace!(
                    message_id = %message.message_id,
                    remaining_count = remaining.len(),
                    "sequential coordination stopped after failure, leaving remainder queued"
                );
                results.extend(remaining.into_iter().map(|r| (r, DeliveryResult::queued(DeliveryMode::Push))));
                break;
            }
        }
        results
    }

    async fn run_conditional(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        rules: &[crate::model::ConditionalRule],
    ) -> Vec<(Address, DeliveryResult)> {
        let mut chosen = Vec::new();
        for rule in rules {
            let branch = if evaluate_condition(&rule.r#if) { &rule.then } else { &rule.r#else };
            chosen.extend(branch.iter().cloned());
        }
        chosen.sort();
        chosen.dedup();
        self.run_parallel(cancellation, message, &chosen).await
    }
}

fn clone_result(result: &ProcessingResult) -> ProcessingResult {
    ProcessingResult {
        message_id: result.message_id,
        overall_status: result.overall_status,
        recipient_results: result.recipient_results.clone(),
    }
}

fn aggregate_status(results: &[(Address, DeliveryResult)]) -> DeliveryStatus {
    if results.is_empty() {
        return DeliveryStatus::Delivering;
    }
    if results.iter().all(|(_, r)| r.status == DeliveryStatus::Delivered) {
        DeliveryStatus::Delivered
    } else if results.iter().any(|(_, r)| r.status == DeliveryStatus::Failed) {
        DeliveryStatus::Failed
    } else {
        DeliveryStatus::Delivering
    }
}

fn apply_results(status: &mut MessageStatus, results: &[(Address, DeliveryResult)]) {
    for (address, result) in results {
        if let Some(recipient_status) = status.recipient_statuses.iter_mut().find(|r| &r.address == address) {
            *recipient_status = RecipientStatus {
                address: address.clone(),
                status: result.status,
                timestamp: result.timestamp,
                attempt_count: crate::domain_types::AttemptCount::try_new(result.attempt_count.min(255))
                    .unwrap_or_default(),
                error_code: result.error_code.clone(),
                error_message: result.error_message.clone(),
                delivery_mode: result.delivery_mode,
                local_delivery: result.local_delivery,
                inbox_delivered: result.local_delivery && result.status == DeliveryStatus::Delivered,
                acknowledged: recipient_status.acknowledged,
                acknowledged_at: recipient_status.acknowledged_at,
            };
        }
    }
}
