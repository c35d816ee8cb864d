//! Crate-wide error taxonomy.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Storage-layer errors (stores fail fast; never panic across a component
/// boundary).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("invalid state transition for {entity} {id}: {detail}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error("query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Transport-level errors: HTTP non-2xx, timeouts, malformed JSON-RPC
/// envelopes. Not retried by the client itself — the caller decides.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("malformed JSON-RPC envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// The JSON-RPC error code this transport error maps to (spec §6).
    pub fn rpc_code(&self) -> i64 {
        match self {
            TransportError::UnknownAgent(_) | TransportError::UnknownNode(_) => -32001,
            TransportError::MethodNotFound(_) => -32601,
            TransportError::InvalidParams(_) | TransportError::MalformedEnvelope(_) => -32602,
            TransportError::Internal(_) => -32603,
            TransportError::Timeout(_)
            | TransportError::ConnectionFailed(_)
            | TransportError::Http(_) => -32000,
        }
    }
}

/// Migration phase the error originated in, used to pick the side-effect
/// free error-classification branch in `advancePhaseWithRetry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorOrigin {
    Source,
    Target,
}

/// How the migration engine should respond to a given error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry { max_attempts: u32, delay_ms: u64 },
    AutoRollback,
    Abort { cleanup_required: bool },
}

/// Migration errors grouped by phase, per spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MigrationErrorCode {
    #[error("AUTH_TIMEOUT")]
    AuthTimeout,
    #[error("FREEZE_INVALID_STATE")]
    FreezeInvalidState,
    #[error("FREEZE_ACK_TIMEOUT")]
    FreezeAckTimeout,
    #[error("SNAPSHOT_PORTABLE_SIZE_EXCEEDED")]
    SnapshotPortableSizeExceeded,
    #[error("SNAPSHOT_ARCHIVE_FAILED")]
    SnapshotArchiveFailed,
    #[error("SNAPSHOT_CHECKSUM_FAILED")]
    SnapshotChecksumFailed,
    #[error("TRANSFER_NETWORK_FAILED")]
    TransferNetworkFailed,
    #[error("TRANSFER_TIMEOUT")]
    TransferTimeout,
    #[error("VERIFY_CHECKSUM_MISMATCH")]
    VerifyChecksumMismatch,
    #[error("VERIFY_SIZE_MISMATCH")]
    VerifySizeMismatch,
    #[error("VERIFY_ARCHIVE_CORRUPT")]
    VerifyArchiveCorrupt,
    #[error("VERIFY_ACK_TIMEOUT")]
    VerifyAckTimeout,
    #[error("REHYDRATE_EXTRACT_FAILED")]
    RehydrateExtractFailed,
    #[error("REHYDRATE_GIT_CLONE_FAILED")]
    RehydrateGitCloneFailed,
    #[error("FINALIZE_NOTIFICATION_FAILED")]
    FinalizeNotificationFailed,
    #[error("FINALIZE_REGISTRY_UPDATE_FAILED")]
    FinalizeRegistryUpdateFailed,
    #[error("INTERNAL_STATE_INCONSISTENCY")]
    InternalStateInconsistency,
    #[error("UNKNOWN")]
    Unknown,
}

impl MigrationErrorCode {
    /// Retry/rollback policy for this error code (spec.md §4.4.5).
    pub fn recovery(self) -> RecoveryAction {
        use MigrationErrorCode::*;
        match self {
            AuthTimeout | TransferNetworkFailed | TransferTimeout | VerifyAckTimeout
            | FinalizeNotificationFailed | FinalizeRegistryUpdateFailed => RecoveryAction::Retry {
                max_attempts: 3,
                delay_ms: 30_000,
            },
            RehydrateGitCloneFailed => RecoveryAction::Retry {
                max_attempts: 2,
                delay_ms: 10_000,
            },
            FreezeAckTimeout | SnapshotArchiveFailed | SnapshotChecksumFailed
            | VerifyChecksumMismatch | VerifySizeMismatch | VerifyArchiveCorrupt => {
                RecoveryAction::Retry {
                    max_attempts: 2,
                    delay_ms: 5_000,
                }
            }
            SnapshotPortableSizeExceeded => RecoveryAction::Abort {
                cleanup_required: false,
            },
            RehydrateExtractFailed => RecoveryAction::AutoRollback,
            FreezeInvalidState | InternalStateInconsistency | Unknown => RecoveryAction::Abort {
                cleanup_required: true,
            },
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self.recovery(), RecoveryAction::Retry { .. })
    }
}

/// A structured migration error: code, phase, origin, and recovery
/// classification, per spec.md §7 item 4.
#[derive(Debug, Clone, thiserror::Error)]
#[error("migration error {code} in phase {phase} (origin: {origin:?}): {message}")]
pub struct MigrationError {
    pub code: MigrationErrorCode,
    pub message: String,
    pub phase: String,
    pub origin: MigrationErrorOrigin,
    pub details: Option<String>,
}

impl MigrationError {
    pub fn new(
        code: MigrationErrorCode,
        phase: impl Into<String>,
        origin: MigrationErrorOrigin,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            phase: phase.into(),
            origin,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn recovery(&self) -> RecoveryAction {
        self.code.recovery()
    }
}
