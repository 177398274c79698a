//! Error types for smtpd-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    /// A single configuration problem (unreadable file, bad settings map, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every problem found while validating the configuration, reported at once
    #[error("{} configuration error(s) occurred:\n\t* {}", .0.len(), .0.join("\n\t* "))]
    InvalidConfig(Vec<String>),

    #[error(transparent)]
    Authentication(#[from] AuthError),

    #[error("user has not authenticated. anonymous access is not allowed")]
    Unauthorized,

    #[error("Envelope parse error: {0}")]
    EnvelopeParse(String),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("empty sender registry")]
    EmptyRegistry,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Failures of a single authentication attempt. None of them end the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid identity")]
    InvalidIdentity,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("unsupported authentication mechanism")]
    UnsupportedMechanism,

    #[error("malformed authentication response: {0}")]
    Malformed(String),
}

/// Delivery failure reported by an upstream forwarder
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("message has no sender")]
    MissingSender,

    #[error("message has no recipients")]
    MissingRecipients,

    #[error("smtp relay error: {0}")]
    Smtp(String),

    #[error("email API request failed: {0}")]
    Http(String),

    #[error("email API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("delivery cancelled")]
    Cancelled,
}
