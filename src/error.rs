//! Error types for the wallet host.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire code for a request cancelled by the application.
pub const CODE_CANCELLED: &str = "CANCELLED";

/// Wire code for a confirmation whose rendered content does not match what would be signed.
pub const CODE_INTENT_DIGEST_MISMATCH: &str = "INTENT_DIGEST_MISMATCH";

/// Top-level error type for the host runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Confirmation error: {0}")]
    Confirm(#[from] ConfirmError),

    #[error("WebAuthn error: {0}")]
    Ceremony(#[from] CeremonyError),

    #[error("Chain RPC error: {0}")]
    Chain(#[from] ChainError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Account {account_id} is not registered on this device")]
    AccountNotFound { account_id: String },

    #[error("Request cancelled")]
    Cancelled,
}

/// Error body carried by `ERROR` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(CODE_CANCELLED, "Request cancelled")
    }
}

/// Configuration-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Message channel errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Port {port_id} is closed")]
    Closed { port_id: u64 },

    #[error("Channel handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    #[error("No channel adopted yet")]
    NotConnected,
}

/// Worker execution context errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker {worker_id} did not report ready within {timeout:?}")]
    HealthCheckFailed { worker_id: u64, timeout: Duration },

    #[error("Worker {worker_id} terminated unexpectedly")]
    Crashed { worker_id: u64 },

    #[error("Worker {worker_id} returned a malformed response: {reason}")]
    MalformedResponse { worker_id: u64, reason: String },

    #[error("Worker operation {operation} failed: {reason}")]
    OperationFailed { operation: String, reason: String },

    #[error("Worker pool exhausted ({capacity} workers in use)")]
    PoolExhausted { capacity: usize },

    #[error("Timed out waiting for {message} from worker {worker_id} after {timeout:?}")]
    ControlTimeout {
        worker_id: u64,
        message: &'static str,
        timeout: Duration,
    },
}

/// Signing session errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Signing session {session_id} already exists")]
    AlreadyExists { session_id: String },

    #[error("Signing session {session_id} not found")]
    NotFound { session_id: String },

    #[error("Signing session {session_id} handshake failed: {reason}")]
    HandshakeFailed { session_id: String, reason: String },

    #[error("Handshake for signing session {session_id} timed out after {timeout:?}")]
    HandshakeTimeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Operation on signing session {session_id} timed out after {timeout:?}")]
    OperationTimeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Wrap key seed for session {session_id} unavailable: {reason}")]
    SeedUnavailable { session_id: String, reason: String },
}

/// Confirmation gate errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfirmError {
    #[error("User cancelled confirmation")]
    Rejected { message: Option<String> },

    #[error("Intent digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("Confirmation surface was superseded by a newer one")]
    Superseded,

    #[error("No confirmation surface binding registered for {kind}")]
    UnknownSurface { kind: String },
}

/// WebAuthn ceremony errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CeremonyError {
    #[error("The platform rejected the ceremony: {0}")]
    NotAllowed(String),

    #[error("Ceremony aborted: {reason}")]
    Aborted { reason: String },

    #[error("Ceremony timed out after {0:?}")]
    Timeout(Duration),

    #[error("WebAuthn requires a secure context")]
    InsecureContext,

    #[error("Ceremony cannot run in this browsing context")]
    ContextNotPermitted,

    #[error("Authenticator did not return PRF outputs")]
    MissingPrfOutputs,

    #[error("Ceremony failed: {0}")]
    Failed(String),
}

/// NEAR RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC request {method} failed: {reason}")]
    RequestFailed { method: String, reason: String },

    #[error("RPC {method} returned an error: {message}")]
    Rpc { method: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Account creation relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay is not configured")]
    NotConfigured,

    #[error("Relay refused to create {account_id}: {message}")]
    Rejected { account_id: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Strip anything that looks like credential material out of a platform message.
fn redact_ceremony_detail(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let looks_encoded = word.len() >= 24
                && word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '=');
            if looks_encoded { "[REDACTED]" } else { word }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl CeremonyError {
    fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::NotAllowed(detail) => ErrorPayload::new(
                "WEBAUTHN_NOT_ALLOWED",
                format!(
                    "The passkey prompt was dismissed or not allowed: {}",
                    redact_ceremony_detail(detail)
                ),
            ),
            Self::Aborted { reason } => ErrorPayload::new(
                "WEBAUTHN_ABORTED",
                format!("The passkey prompt was aborted ({reason})"),
            ),
            Self::Timeout(_) => ErrorPayload::new("WEBAUTHN_TIMEOUT", self.to_string()),
            Self::InsecureContext => {
                ErrorPayload::new("WEBAUTHN_INSECURE_CONTEXT", self.to_string())
            }
            Self::ContextNotPermitted | Self::MissingPrfOutputs => {
                ErrorPayload::new("WEBAUTHN_FAILED", self.to_string())
            }
            Self::Failed(detail) => ErrorPayload::new(
                "WEBAUTHN_FAILED",
                format!("Ceremony failed: {}", redact_ceremony_detail(detail)),
            ),
        }
    }
}

impl Error {
    /// Map runtime errors onto the stable wire surface used by `ERROR` envelopes.
    pub fn to_error_payload(&self) -> ErrorPayload {
        match self {
            Self::Config(err) => match err {
                ConfigError::MissingRequired { .. } => {
                    ErrorPayload::new("CONFIG_MISSING", err.to_string())
                }
                ConfigError::InvalidValue { .. } => {
                    ErrorPayload::new("CONFIG_INVALID", err.to_string())
                }
            },
            Self::Channel(err) => ErrorPayload::new("CHANNEL_ERROR", err.to_string()),
            Self::Worker(err) => match err {
                WorkerError::MalformedResponse { .. } => {
                    ErrorPayload::new("WORKER_MALFORMED_RESPONSE", err.to_string())
                }
                WorkerError::PoolExhausted { .. } => {
                    ErrorPayload::new("POOL_EXHAUSTED", err.to_string())
                }
                WorkerError::ControlTimeout { .. } => {
                    ErrorPayload::new("HANDSHAKE_TIMEOUT", err.to_string())
                }
                _ => ErrorPayload::new("WORKER_FAILED", err.to_string()),
            },
            Self::Session(err) => match err {
                SessionError::AlreadyExists { .. } => {
                    ErrorPayload::new("SESSION_EXISTS", err.to_string())
                }
                SessionError::NotFound { .. } => {
                    ErrorPayload::new("SESSION_NOT_FOUND", err.to_string())
                }
                SessionError::HandshakeFailed { .. } => {
                    ErrorPayload::new("HANDSHAKE_FAILED", err.to_string())
                }
                SessionError::HandshakeTimeout { .. } => {
                    ErrorPayload::new("HANDSHAKE_TIMEOUT", err.to_string())
                }
                SessionError::OperationTimeout { .. } => {
                    ErrorPayload::new("OPERATION_TIMEOUT", err.to_string())
                }
                SessionError::SeedUnavailable { .. } => {
                    ErrorPayload::new("SEED_UNAVAILABLE", err.to_string())
                }
            },
            Self::Confirm(err) => match err {
                ConfirmError::DigestMismatch { .. } => ErrorPayload::new(
                    CODE_INTENT_DIGEST_MISMATCH,
                    "Displayed transaction does not match the transaction to be signed",
                ),
                ConfirmError::Rejected { message } => ErrorPayload::new(
                    CODE_CANCELLED,
                    message
                        .clone()
                        .unwrap_or_else(|| "User cancelled confirmation".to_string()),
                ),
                ConfirmError::Superseded => ErrorPayload::new(CODE_CANCELLED, err.to_string()),
                ConfirmError::UnknownSurface { .. } => {
                    ErrorPayload::new("CONFIRM_UI_UNAVAILABLE", err.to_string())
                }
            },
            Self::Ceremony(err) => err.to_error_payload(),
            Self::Chain(err) => ErrorPayload::new("CHAIN_ERROR", err.to_string()),
            Self::Relay(err) => ErrorPayload::new("RELAY_ERROR", err.to_string()),
            Self::InvalidRequest(_) => ErrorPayload::new("INVALID_REQUEST", self.to_string()),
            Self::AccountNotFound { .. } => {
                ErrorPayload::new("ACCOUNT_NOT_FOUND", self.to_string())
            }
            Self::Cancelled => ErrorPayload::cancelled(),
        }
    }
}

/// Result type alias for the host runtime.
pub type Result<T> = std::result::Result<T, Error>;
