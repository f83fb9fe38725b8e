//! Error types for Mailflow.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
///
/// `UniqueViolation` is split out from `Query` because the dispatch and
/// ingestion paths catch it specifically (idempotent create, dedup guard);
/// any other constraint failure stays a genuine error.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Map a libsql error, classifying unique-constraint failures separately.
    pub fn from_libsql(op: &str, e: libsql::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("UNIQUE constraint failed") {
            DatabaseError::UniqueViolation(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }

    /// Whether this error is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DatabaseError::UniqueViolation(_))
    }
}

/// Outbound dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Request {0} not found")]
    RequestNotFound(String),

    #[error("Request {id} is not ready to send: {reason}")]
    NotReady { id: String, reason: String },

    #[error("Request {0} has no recipients")]
    NoRecipients(String),

    #[error("Transport failed for request {id}: {reason} (safe to retry)")]
    TransportFailed { id: String, reason: String },
}

/// Inbound ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed inbound payload: {0}")]
    Malformed(String),

    #[error("Attachment storage failed for {filename}: {reason}")]
    AttachmentStorage { filename: String, reason: String },
}

/// Provider sync errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Provider {0} is not supported")]
    UnsupportedProvider(String),

    #[error("Account {account_id} credentials revoked — reconnect required")]
    CredentialRevoked { account_id: Uuid },

    #[error("Credential refresh failed for account {account_id}: {reason}")]
    RefreshFailed { account_id: Uuid, reason: String },

    #[error("Provider {provider} request failed: {reason}")]
    Provider { provider: String, reason: String },
}

/// Delivery queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queued email {0} not found")]
    NotFound(Uuid),

    #[error("Queued email {id} not claimable in state {state}")]
    NotClaimable { id: Uuid, state: String },
}

/// Mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Rate limited by outbound transport")]
    RateLimited,

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
