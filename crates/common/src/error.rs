use thiserror::Error;

/// Canonical DFQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`DfqError::InvalidConfig`]: configuration/endpoint contract violations discovered before any RPC
/// - [`DfqError::Codec`]: wire encode/decode failures for either framing
/// - [`DfqError::Rpc`]: transport-level failures surfaced by the HTTP client
/// - [`DfqError::Io`]: raw filesystem/network IO failures from std APIs
/// - [`DfqError::Internal`]: controller-side invariant violations that are bugs, not inputs
#[derive(Debug, Error)]
pub enum DfqError {
    /// Invalid or inconsistent configuration state.
    ///
    /// Examples:
    /// - zero status-refresh or error-duration windows
    /// - worker base URI that does not parse
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire encode/decode failures.
    ///
    /// Examples:
    /// - reply body that is not valid JSON/MessagePack for the expected type
    /// - unknown `Content-Type` on a worker reply
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport-level RPC failures after the request left the controller.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Controller-side invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard DFQ result alias.
pub type Result<T> = std::result::Result<T, DfqError>;
