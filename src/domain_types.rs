//! Domain types for the AMTP gateway
//!
//! Strongly-typed wrappers around the primitives used across every component, so illegal
//! values (empty recipient lists, malformed addresses, out-of-range timeouts) are caught at
//! construction rather than deep inside delivery logic.

use nutype::nutype;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Time-ordered, globally unique identifier for a `Message`.
///
/// Backed by a UUIDv7 so that lexicographic and creation-time ordering coincide, satisfying
/// the "monotonic, sortable" requirement on `message_id`.
#[nutype(
    validate(predicate = |id: &Uuid| !id.is_nil()),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new time-ordered message id.
    ///
    /// # Panics
    ///
    /// Never panics: `Uuid::now_v7()` never produces the nil UUID.
    pub fn generate() -> Self {
        Self::try_new(Uuid::now_v7()).expect("freshly generated UUIDv7 is never nil")
    }
}

/// Client-supplied or ingress-derived deduplication key.
#[nutype(
    validate(predicate = |id: &Uuid| !id.is_nil()),
    derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    /// Generates a new random idempotency key.
    ///
    /// # Panics
    ///
    /// Never panics: `Uuid::new_v4()` never produces the nil UUID.
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4()).expect("freshly generated UUIDv4 is never nil")
    }
}

/// A canonical `name@domain` agent address.
///
/// Validation only checks shape (exactly one `@`, non-empty name and domain, no whitespace);
/// canonicalisation (appending the local domain to a bare name) is the Agent Registry's job.
#[nutype(
    sanitize(trim),
    validate(predicate = |addr: &str| is_well_formed_address(addr)),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into, AsRef
    )
)]
pub struct Address(String);

fn is_well_formed_address(addr: &str) -> bool {
    let Some((name, domain)) = addr.split_once('@') else {
        return false;
    };
    !name.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !addr.chars().any(char::is_whitespace)
}

impl Address {
    /// Splits the address into its `(name, domain)` halves.
    ///
    /// # Panics
    ///
    /// Never panics: construction guarantees exactly one `@` separator.
    pub fn parts(&self) -> (&str, &str) {
        self.as_ref().split_once('@').expect("validated address")
    }

    /// The domain half of the address.
    pub fn domain(&self) -> &str {
        self.parts().1
    }
}

/// The gateway's own routing domain, e.g. `example.com`.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 253),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Into)
)]
pub struct LocalDomain(String);

/// A message or agent schema identifier, e.g. `invoice.v1` or a `prefix.*` wildcard.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into, AsRef
    )
)]
pub struct SchemaName(String);

/// Size of a serialised message, in bytes. Bounded by a generous platform sanity limit, not by
/// `GatewayConfig::max_message_size` — that check happens where the limit is known.
#[nutype(
    validate(less_or_equal = 1_099_511_627_776usize),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 0
)]
pub struct MessageSize(usize);

impl MessageSize {
    /// Gets the value as usize.
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// Number of delivery attempts made so far for one recipient.
#[nutype(
    validate(greater_or_equal = 0, less_or_equal = 255),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom, Into
    ),
    default = 0
)]
pub struct AttemptCount(u32);

impl AttemptCount {
    /// Gets the value as u32.
    pub fn as_u32(self) -> u32 {
        self.into_inner()
    }

    /// Returns the next attempt count.
    #[must_use]
    pub fn increment(self) -> Self {
        Self::try_new(self.into_inner().saturating_add(1)).unwrap_or(self)
    }
}

/// Maximum retry attempts configured for the Delivery Engine.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32.
    pub fn as_u32(self) -> u32 {
        self.into_inner()
    }
}

/// Base retry delay, in milliseconds, for the exponential backoff formula.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct BaseRetryDelayMs(u64);

impl BaseRetryDelayMs {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Capability/discovery cache entry time-to-live, in seconds.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct TtlSeconds(u64);

impl TtlSeconds {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// HTTP client request timeout, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct HttpTimeoutMs(u64);

impl HttpTimeoutMs {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Bound on outbound HTTP connections held open by the Delivery Engine's client.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct MaxConnections(usize);

impl MaxConnections {
    /// Gets the value as usize.
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// Idle connection timeout, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct IdleTimeoutMs(u64);

impl IdleTimeoutMs {
    /// Converts to a `Duration`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Bound on concurrently in-flight deliveries within one `DeliverBatch` call.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct BatchConcurrency(usize);

impl BatchConcurrency {
    /// Gets the value as usize.
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// In-memory storage capacity, as a message count, before `CapacityExceeded` is returned.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        TryFrom, Into
    )
)]
pub struct StorageCapacity(usize);

impl StorageCapacity {
    /// Gets the value as usize.
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// `SQLite` connection pool size.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, TryFrom, Into),
    default = 10
)]
pub struct ConnectionPoolSize(u32);

impl ConnectionPoolSize {
    /// Gets the value as usize.
    pub fn as_usize(self) -> usize {
        self.into_inner() as usize
    }
}

/// Non-empty salt mixed into API-key digests before hashing.
#[nutype(
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TryFrom, Into, AsRef)
)]
pub struct ApiKeySalt(String);

/// Domain-level validation errors shared across components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Invalid field value with descriptive reason.
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Required field is missing or empty.
    #[error("missing required field: {field}")]
    MissingField { field: String },

    /// Domain constraint violation not tied to a single field.
    #[error("constraint violation: {constraint}")]
    ConstraintViolation { constraint: String },
}
