//! Wire-level data model: `Message` and the records that describe its delivery lifecycle.
//!
//! These types compose the primitives in [`crate::domain_types`]; validation of cross-field
//! invariants (non-empty recipients, non-empty sequences) happens in each smart constructor,
//! following the teacher's `FipaMessage::try_new_validated` pattern.

use crate::domain_types::{Address, AttemptCount, MessageId, SchemaName, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An attachment reference carried alongside a message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub hash: String,
    pub url: String,
}

/// A detached signature over the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: String,
    pub key_id: String,
    pub value: String,
}

/// One `{if, then, else}` branch of a conditional coordination plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalRule {
    /// Minimal expression: `always`, `never`, or an unrecognised string (treated as `always`
    /// by the evaluator, matching the deliberately thin condition language this gateway ships).
    pub r#if: String,
    pub then: Vec<Address>,
    #[serde(default)]
    pub r#else: Vec<Address>,
}

/// How a message's recipients are attempted relative to one another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CoordinationConfig {
    /// All recipients dispatched concurrently, bounded by `timeout_secs`.
    Parallel { timeout_secs: u64 },
    /// Recipients attempted strictly in `sequence` order.
    Sequential {
        sequence: Vec<Address>,
        stop_on_failure: bool,
    },
    /// Recipients selected by evaluating `rules` against the message.
    Conditional { rules: Vec<ConditionalRule> },
}

impl CoordinationConfig {
    /// Builds a `parallel` plan, rejecting a non-positive timeout.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidField` when `timeout_secs` is zero.
    pub fn parallel(timeout_secs: u64) -> Result<Self, ValidationError> {
        if timeout_secs == 0 {
            return Err(ValidationError::InvalidField {
                field: "timeout_secs".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self::Parallel { timeout_secs })
    }

    /// Builds a `sequential` plan, rejecting an empty sequence.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` when `sequence` is empty.
    pub fn sequential(sequence: Vec<Address>, stop_on_failure: bool) -> Result<Self, ValidationError> {
        if sequence.is_empty() {
            return Err(ValidationError::MissingField {
                field: "sequence".to_string(),
            });
        }
        Ok(Self::Sequential {
            sequence,
            stop_on_failure,
        })
    }

    /// Builds a `conditional` plan, rejecting an empty rule list.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` when `rules` is empty.
    pub fn conditional(rules: Vec<ConditionalRule>) -> Result<Self, ValidationError> {
        if rules.is_empty() {
            return Err(ValidationError::MissingField {
                field: "rules".to_string(),
            });
        }
        Ok(Self::Conditional { rules })
    }
}

/// The transferable unit accepted by the Processor and relayed between gateways.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub version: String,
    pub message_id: MessageId,
    pub idempotency_key: crate::domain_types::IdempotencyKey,
    pub timestamp: DateTime<Utc>,
    pub sender: Address,
    pub recipients: Vec<Address>,
    pub subject: Option<String>,
    pub schema: Option<SchemaName>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub signature: Option<Signature>,
    pub coordination: Option<CoordinationConfig>,
    pub in_reply_to: Option<MessageId>,
    pub response_type: Option<String>,
}

/// Protocol version this gateway emits and accepts.
pub const PROTOCOL_VERSION: &str = "1.0";

impl Message {
    /// Constructs a new message, assigning `version`, `message_id`, and `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` when `recipients` is empty.
    #[allow(clippy::too_many_arguments)]
    pub fn accept(
        idempotency_key: crate::domain_types::IdempotencyKey,
        sender: Address,
        recipients: Vec<Address>,
        subject: Option<String>,
        schema: Option<SchemaName>,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
        coordination: Option<CoordinationConfig>,
    ) -> Result<Self, ValidationError> {
        if recipients.is_empty() {
            return Err(ValidationError::MissingField {
                field: "recipients".to_string(),
            });
        }
        Ok(Self {
            version: PROTOCOL_VERSION.to_string(),
            message_id: MessageId::generate(),
            idempotency_key,
            timestamp: Utc::now(),
            sender,
            recipients,
            subject,
            schema,
            headers,
            payload,
            attachments: Vec::new(),
            signature: None,
            coordination,
            in_reply_to: None,
            response_type: None,
        })
    }

    /// The serialised size of this message's payload plus headers, used against
    /// `GatewayConfig::max_message_size`.
    pub fn approximate_size(&self) -> crate::domain_types::MessageSize {
        let headers_size: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        crate::domain_types::MessageSize::try_new(self.payload.len() + headers_size)
            .unwrap_or_default()
    }
}

/// How a recipient's transport accepts delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The gateway actively POSTs the message to the agent's configured endpoint.
    Push,
    /// The message waits in the recipient's inbox until fetched.
    Pull,
}

/// Lifecycle state of a message or one recipient's delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Queued,
    Delivering,
    Delivered,
    Failed,
    Retrying,
}

/// Per-recipient delivery outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub address: Address,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub attempt_count: AttemptCount,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub local_delivery: bool,
    pub inbox_delivered: bool,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl RecipientStatus {
    /// A freshly created, not-yet-attempted recipient status.
    pub fn pending(address: Address, delivery_mode: DeliveryMode) -> Self {
        Self {
            address,
            status: DeliveryStatus::Pending,
            timestamp: Utc::now(),
            attempt_count: AttemptCount::default(),
            error_code: None,
            error_message: None,
            delivery_mode,
            local_delivery: false,
            inbox_delivered: false,
            acknowledged: false,
            acknowledged_at: None,
        }
    }
}

/// Per-message aggregate status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: MessageId,
    pub overall_status: DeliveryStatus,
    pub recipient_statuses: Vec<RecipientStatus>,
    pub attempts: AttemptCount,
    pub next_retry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl MessageStatus {
    /// Builds the initial aggregate for a just-accepted message: one pending `RecipientStatus`
    /// per recipient, in the order they appear on the message.
    pub fn initial(message_id: MessageId, recipients: &[Address], delivery_mode: DeliveryMode) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            overall_status: DeliveryStatus::Pending,
            recipient_statuses: recipients
                .iter()
                .cloned()
                .map(|addr| RecipientStatus::pending(addr, delivery_mode))
                .collect(),
            attempts: AttemptCount::default(),
            next_retry: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
        }
    }

    /// Recomputes `overall_status` from the current recipient statuses, per the invariant that
    /// `delivered` holds iff every recipient is `delivered`, and `failed` iff at least one
    /// recipient is `failed` and none remain in progress.
    pub fn recompute_overall_status(&mut self) {
        let all_delivered = self
            .recipient_statuses
            .iter()
            .all(|r| r.status == DeliveryStatus::Delivered);
        let any_in_progress = self.recipient_statuses.iter().any(|r| {
            matches!(
                r.status,
                DeliveryStatus::Pending
                    | DeliveryStatus::Queued
                    | DeliveryStatus::Delivering
                    | DeliveryStatus::Retrying
            )
        });
        let any_failed = self
            .recipient_statuses
            .iter()
            .any(|r| r.status == DeliveryStatus::Failed);

        self.overall_status = if all_delivered {
            DeliveryStatus::Delivered
        } else if any_failed && !any_in_progress {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Delivering
        };
        self.updated_at = Utc::now();
        if self.overall_status == DeliveryStatus::Delivered && self.delivered_at.is_none() {
            self.delivered_at = Some(self.updated_at);
        }
    }
}

/// A local recipient identity registered with this gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAgent {
    pub address: Address,
    pub delivery_mode: DeliveryMode,
    pub push_target: Option<String>,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    pub hashed_api_key: String,
    #[serde(default)]
    pub supported_schemas: Vec<SchemaName>,
    pub requires_schema: bool,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
}

/// A peer gateway's announced parameters, as returned by capability discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AMTPCapabilities {
    pub version: String,
    pub gateway_url: String,
    pub supported_auth_methods: Vec<String>,
    pub max_message_size: crate::domain_types::MessageSize,
    pub features: Vec<String>,
    pub discovered_at: DateTime<Utc>,
    pub ttl: crate::domain_types::TtlSeconds,
}

impl AMTPCapabilities {
    /// Whether this cache entry is still valid, per the strict `discovered_at + ttl` expiry
    /// invariant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.discovered_at + chrono::Duration::seconds(self.ttl.as_duration().as_secs() as i64)
    }

    /// Whether this peer's advertised schema list covers `schema` — an empty list is a
    /// wildcard, and a `prefix.*` entry matches any schema starting with `prefix.`.
    pub fn supports_schema(&self, schema: &SchemaName, schemas: &[SchemaName]) -> bool {
        if schemas.is_empty() {
            return true;
        }
        schemas.iter().any(|candidate| {
            let candidate = candidate.as_ref();
            if let Some(prefix) = candidate.strip_suffix(".*") {
                schema.as_ref().starts_with(prefix)
            } else {
                candidate == schema.as_ref()
            }
        })
    }
}
