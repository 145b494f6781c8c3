//! Crate-wide error taxonomy for the AMTP gateway.
//!
//! Each component defines its own `thiserror` enum; `GatewayError` wraps them with `#[from]`
//! and every variant maps to one of the error kinds from the external contract via [`ErrorKind`].

use thiserror::Error;

/// The error-kind codes surfaced across the peer HTTP contract and `DeliveryResult`/
/// `ProcessingResult` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorKind {
    InvalidRequestFormat,
    ValidationFailed,
    InvalidRecipient,
    InvalidGateway,
    DiscoveryFailed,
    CapabilitiesNotFound,
    MessageTooLarge,
    AgentNotFound,
    PushFailed,
    Remote4xx,
    Remote5xxExhausted,
    Timeout,
    ContextCancelled,
    ProcessingFailed,
    MessageNotFound,
    MessageNotInInbox,
    AlreadyAcknowledged,
    AccessDenied,
    CapacityExceeded,
    Internal,
}

impl ErrorKind {
    /// The wire code for this kind, as used in `error_code` fields.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequestFormat => "INVALID_REQUEST_FORMAT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidRecipient => "INVALID_RECIPIENT",
            Self::InvalidGateway => "INVALID_GATEWAY",
            Self::DiscoveryFailed => "DISCOVERY_FAILED",
            Self::CapabilitiesNotFound => "CAPABILITIES_NOT_FOUND",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::PushFailed => "PUSH_FAILED",
            Self::Remote4xx => "REMOTE_4XX",
            Self::Remote5xxExhausted => "REMOTE_5XX_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::ContextCancelled => "CONTEXT_CANCELLED",
            Self::ProcessingFailed => "PROCESSING_FAILED",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::MessageNotInInbox => "MESSAGE_NOT_IN_INBOX",
            Self::AlreadyAcknowledged => "ALREADY_ACKNOWLEDGED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status an ingress layer should map this kind to.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequestFormat
            | Self::ValidationFailed
            | Self::InvalidRecipient
            | Self::InvalidGateway
            | Self::AccessDenied
            | Self::MessageNotFound
            | Self::MessageNotInInbox
            | Self::AlreadyAcknowledged
            | Self::AgentNotFound => 400,
            Self::CapacityExceeded => 429,
            _ => 500,
        }
    }
}

/// Top-level error type returned by gateway-facing entry points (HTTP handlers, the CLI).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Discovery(#[from] crate::discovery::DiscoveryError),

    #[error(transparent)]
    Processor(#[from] crate::processor::ProcessorError),

    #[error(transparent)]
    Inbox(#[from] crate::inbox::InboxError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl GatewayError {
    /// The error kind this error maps to on the external contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::Discovery(e) => e.kind(),
            Self::Processor(e) => e.kind(),
            Self::Inbox(e) => e.kind(),
            Self::Config(_) => ErrorKind::Internal,
        }
    }
}
