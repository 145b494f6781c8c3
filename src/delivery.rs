//! Delivery Engine: resolves one recipient to local-pull, local-push, or remote-peer delivery,
//! retrying transient failures with jittered exponential backoff.

use crate::discovery::{validate_gateway_url, Discovery};
use crate::domain_types::{Address, BaseRetryDelayMs, MaxRetries};
use crate::error::ErrorKind;
use crate::model::{DeliveryMode, Message};
use crate::registry::{AgentRegistry, RegistryError};
use crate::storage::{Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Errors raised directly by the Delivery Engine (distinct from the per-recipient
/// `DeliveryResult.error_code`, which covers recoverable outcomes the engine reports rather
/// than propagates).
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DeliveryError {
    /// Maps this error onto the external error-kind contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(e) => e.kind(),
            Self::Storage(e) => e.kind(),
        }
    }
}

/// Transport-level outcome classification, kept separate from HTTP status codes so the retry
/// classifier never substring-matches an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportError {
    Timeout,
    ConnectionRefused,
    NoSuchHost,
    NetworkUnreachable,
    Other,
}

impl TransportError {
    fn classify(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout;
        }
        if error.is_connect() {
            let message = error.to_string();
            if message.contains("refused") {
                return Self::ConnectionRefused;
            }
            if message.contains("dns error") || message.contains("failed to lookup") {
                return Self::NoSuchHost;
            }
            if message.contains("unreachable") {
                return Self::NetworkUnreachable;
            }
        }
        Self::Other
    }

    fn is_retryable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Outcome of one `deliver_message` call.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeliveryResult {
    pub status: crate::model::DeliveryStatus,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attempt_count: u32,
    pub delivery_mode: DeliveryMode,
    pub local_delivery: bool,
}

impl DeliveryResult {
    fn failed(error_code: &str, error_message: impl Into<String>, attempt_count: u32, delivery_mode: DeliveryMode) -> Self {
        Self {
            status: crate::model::DeliveryStatus::Failed,
            http_status: None,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.into()),
            timestamp: Utc::now(),
            attempt_count,
            delivery_mode,
            local_delivery: false,
        }
    }

    fn delivered(attempt_count: u32, delivery_mode: DeliveryMode, local_delivery: bool, http_status: Option<u16>) -> Self {
        Self {
            status: crate::model::DeliveryStatus::Delivered,
            http_status,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
            attempt_count,
            delivery_mode,
            local_delivery,
        }
    }

    /// A recipient left un-attempted by sequential coordination that stopped early at an
    /// earlier recipient's failure.
    pub(crate) fn queued(delivery_mode: DeliveryMode) -> Self {
        Self {
            status: crate::model::DeliveryStatus::Queued,
            http_status: None,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
            attempt_count: 0,
            delivery_mode,
            local_delivery: false,
        }
    }
}

/// Delivers a message to one or many recipients, owning the long-lived outbound HTTP client.
#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    /// Delivers `message` to `recipient_addr`, internally retrying transient failures.
    async fn deliver_message(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipient_addr: &Address,
    ) -> DeliveryResult;

    /// Delivers to every recipient concurrently, bounded by the configured batch concurrency.
    /// Never aggregates; aggregation is the Processor's job.
    async fn deliver_batch(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipients: &[Address],
    ) -> HashMap<Address, DeliveryResult>;
}

/// Default `DeliveryEngine`, dispatching local recipients through `Storage`/`AgentRegistry`
/// and remote recipients through a shared `reqwest::Client`.
pub struct DefaultDeliveryEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    discovery: Arc<dyn Discovery>,
    http: reqwest::Client,
    local_domain: String,
    user_agent: String,
    max_retries: MaxRetries,
    base_retry_delay: BaseRetryDelayMs,
    batch_semaphore: Arc<Semaphore>,
    allow_insecure_http: bool,
}

impl DefaultDeliveryEngine {
    /// Builds an engine over the given shared components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        discovery: Arc<dyn Discovery>,
        http: reqwest::Client,
        local_domain: String,
        user_agent: String,
        max_retries: MaxRetries,
        base_retry_delay: BaseRetryDelayMs,
        batch_concurrency: usize,
        allow_insecure_http: bool,
    ) -> Self {
        Self {
            storage,
            registry,
            discovery,
            http,
            local_domain,
            user_agent,
            max_retries,
            base_retry_delay,
            batch_semaphore: Arc::new(Semaphore::new(batch_concurrency)),
            allow_insecure_http,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_retry_delay.as_duration();
        let exponential = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
        let capped = exponential.min(Duration::from_secs(300));
        let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
        capped.mul_f64(1.0 + jitter)
    }

    async fn deliver_local(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipient: &Address,
    ) -> DeliveryResult {
        let agent = match self.registry.get(recipient) {
            Ok(agent) => agent,
            Err(_) => {
                warn!(%recipient, "local delivery attempted for unregistered agent");
                return DeliveryResult::failed("AGENT_NOT_FOUND", "no such local agent", 1, DeliveryMode::Pull);
            }
        };

        trace!(%recipient, delivery_mode = ?agent.delivery_mode, "dispatching local delivery");
        match agent.delivery_mode {
            DeliveryMode::Pull => {
                let status = crate::model::MessageStatus::initial(
                    message.message_id,
                    std::slice::from_ref(recipient),
                    DeliveryMode::Pull,
                );
                match self.storage.store_message(message.clone(), status).await {
                    Ok(()) | Err(StorageError::AlreadyExists(_)) => {
                        DeliveryResult::delivered(1, DeliveryMode::Pull, true, None)
                    }
                    Err(_) => DeliveryResult::failed("PUSH_FAILED", "failed to persist to inbox", 1, DeliveryMode::Pull),
                }
            }
            DeliveryMode::Push => {
                let Some(push_target) = &agent.push_target else {
                    return DeliveryResult::failed("PUSH_FAILED", "agent has no push target", 1, DeliveryMode::Push);
                };
                self.post_with_retry(cancellation, push_target, message, &agent.request_headers, DeliveryMode::Push, false)
                    .await
            }
        }
    }

    async fn deliver_remote(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        domain: &str,
    ) -> DeliveryResult {
        let capabilities = match self.discovery.discover_capabilities(domain).await {
            Ok(caps) => caps,
            Err(_) => {
                warn!(%domain, "capability discovery failed, remote delivery aborted");
                return DeliveryResult::failed("DISCOVERY_FAILED", "capability discovery failed", 1, DeliveryMode::Push);
            }
        };

        let gateway_url = match validate_gateway_url(&capabilities.gateway_url, self.allow_insecure_http) {
            Ok(url) => url,
            Err(reason) => return DeliveryResult::failed("INVALID_GATEWAY", reason, 1, DeliveryMode::Push),
        };

        let max_size = capabilities.max_message_size.as_usize();
        if max_size > 0 && message.approximate_size().as_usize() > max_size {
            return DeliveryResult::failed("MESSAGE_TOO_LARGE", "message exceeds peer's max size", 1, DeliveryMode::Push);
        }

        let endpoint = format!("{}/v1/messages", gateway_url.as_str().trim_end_matches('/'));
        debug!(%domain, %endpoint, "delivering to remote peer");
        self.post_with_retry(cancellation, &endpoint, message, &HashMap::new(), DeliveryMode::Push, true)
            .await
    }

    async fn post_with_retry(
        &self,
        cancellation: &CancellationToken,
        url: &str,
        message: &Message,
        extra_headers: &HashMap<String, String>,
        delivery_mode: DeliveryMode,
        remote: bool,
    ) -> DeliveryResult {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancellation.is_cancelled() {
                return DeliveryResult::failed("CONTEXT_CANCELLED", "cancelled before attempt", attempt, delivery_mode);
            }

            let mut request = self.http.post(url).header("User-Agent", &self.user_agent).json(message);
            for (key, value) in extra_headers {
                request = request.header(key, value);
            }

            let outcome = tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    return DeliveryResult::failed("CONTEXT_CANCELLED", "cancelled in flight", attempt, delivery_mode);
                }
                result = request.send() => result,
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return DeliveryResult::delivered(attempt, delivery_mode, false, Some(status.as_u16()));
                    }
                    let retryable = is_retryable_status(status.as_u16());
                    if !retryable || attempt >= self.max_retries.as_u32() {
                        let code = if remote && retryable {
                            "REMOTE_5XX_EXHAUSTED"
                        } else if remote {
                            "REMOTE_4XX"
                        } else {
                            "PUSH_FAILED"
                        };
                        warn!(%url, %status, attempt, "delivery failed, giving up");
                        return DeliveryResult::failed(code, format!("peer responded {status}"), attempt, delivery_mode);
                    }
                    debug!(%url, %status, attempt, "retryable peer response, backing off");
                }
                Err(error) => {
                    let transport = TransportError::classify(&error);
                    if !transport.is_retryable() || attempt >= self.max_retries.as_u32() {
                        let code = if matches!(transport, TransportError::Timeout) { "TIMEOUT" } else { "PUSH_FAILED" };
                        warn!(%url, attempt, error = %error, "delivery failed, giving up");
                        return DeliveryResult::failed(code, error.to_string(), attempt, delivery_mode);
                    }
                    debug!(%url, attempt, error = %error, "retryable transport error, backing off");
                }
            }

            let delay = self.backoff_delay(attempt);
            tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    return DeliveryResult::failed("CONTEXT_CANCELLED", "cancelled during backoff", attempt, delivery_mode);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl DeliveryEngine for DefaultDeliveryEngine {
    async fn deliver_message(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipient_addr: &Address,
    ) -> DeliveryResult {
        if cancellation.is_cancelled() {
            return DeliveryResult::failed("CONTEXT_CANCELLED", "cancelled before dispatch", 0, DeliveryMode::Push);
        }
        let domain = recipient_addr.domain();
        if domain == self.local_domain {
            self.deliver_local(cancellation, message, recipient_addr).await
        } else {
            self.deliver_remote(cancellation, message, domain).await
        }
    }

    async fn deliver_batch(
        &self,
        cancellation: &CancellationToken,
        message: &Message,
        recipients: &[Address],
    ) -> HashMap<Address, DeliveryResult> {
        debug!(message_id = %message.message_id, recipient_count = recipients.len(), "dispatching batch delivery");
        let results = futures::future::join_all(recipients.iter().map(|recipient| {
            let permit = self.batch_semaphore.clone();
            async move {
                let _permit = permit.acquire().await;
                let result = self.deliver_message(cancellation, message, recipient).await;
                (recipient.clone(), result)
            }
        }))
        .await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_matches_429_and_5xx_subset() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(500));
    }
}
