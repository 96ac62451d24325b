//! Error taxonomy for the SMS dispatch pipeline
//!
//! Every component boundary returns one of the typed errors below; the
//! aggregate [`DispatchError`] exists for callers that handle several
//! components at once (binaries, the consumption loop).
//!
//! Not every failure is an error here: lock contention and rate-limit
//! rejections are ordinary outcomes and are modelled as return values.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

// ============================================================================
// Broker connection
// ============================================================================

/// Failures while establishing or using the broker connection.
///
/// All variants except `Closed` are transient: the connection manager keeps
/// retrying them with a fixed delay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no broker nodes configured")]
    NoNodes,

    #[error("failed to dial broker node {url}: {reason}")]
    Dial { url: String, reason: String },

    #[error("all {attempted} broker nodes failed, last error: {last}")]
    AllNodesFailed { attempted: usize, last: String },

    #[error("RabbitMQ channel is not open")]
    ChannelNotOpen,

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("broker connection manager is closed")]
    Closed,
}

// ============================================================================
// Publishing
// ============================================================================

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to declare queue {queue}: {reason}")]
    Declaration { queue: String, reason: String },

    #[error("failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// ============================================================================
// Validation
// ============================================================================

/// Permanent rejections. Never retried by the component that raises them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("message has no msg_id")]
    MissingMessageId,

    #[error("invalid MSISDN (expected 11 digits)")]
    InvalidMsisdn,

    #[error("unknown operator prefix: {0}")]
    UnknownPrefix(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}

// ============================================================================
// Shared store, telemetry, statistics
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("shared store error: {0}")]
    Backend(String),

    #[error("unexpected reply from shared store: {0}")]
    UnexpectedReply(String),
}

/// Telemetry failures are logged and counted, never propagated into
/// message disposition.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("telemetry store rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("telemetry transport error: {0}")]
    Transport(String),

    #[error("telemetry recorder is shut down")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum StatisticsError {
    #[error("management API {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },

    #[error("management API request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("failed to decode management API response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Statistics(#[from] StatisticsError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Stable machine-readable code, used as a log field and metric label.
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::Connection(ConnectionError::ChannelNotOpen) => "CHANNEL_NOT_OPEN",
            DispatchError::Connection(_) => "CONNECTION_ERROR",
            DispatchError::Publish(PublishError::Declaration { .. }) => "DECLARATION_ERROR",
            DispatchError::Publish(PublishError::Connection(ConnectionError::ChannelNotOpen)) => {
                "CHANNEL_NOT_OPEN"
            }
            DispatchError::Publish(_) => "PUBLISH_ERROR",
            DispatchError::Validation(ValidationError::UnknownPrefix(_)) => "UNKNOWN_PREFIX",
            DispatchError::Validation(_) => "VALIDATION_ERROR",
            DispatchError::Store(_) => "STORE_ERROR",
            DispatchError::Telemetry(_) => "TELEMETRY_WRITE_ERROR",
            DispatchError::Statistics(_) => "STATISTICS_FETCH_ERROR",
            DispatchError::Config(_) => "CONFIG_ERROR",
            DispatchError::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Connection(e) => e.is_transient(),
            DispatchError::Publish(PublishError::Encode(_)) => false,
            DispatchError::Publish(_) => true,
            DispatchError::Store(_) => true,
            DispatchError::Telemetry(_) => true,
            DispatchError::Statistics(_) => false,
            DispatchError::Validation(_) | DispatchError::Config(_) | DispatchError::Json(_) => {
                false
            }
        }
    }
}

impl ConnectionError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConnectionError::Closed | ConnectionError::NoNodes)
    }
}
