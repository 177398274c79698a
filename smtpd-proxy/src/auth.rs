//! SMTP AUTH support
//!
//! Credential checks are pluggable through [`AuthFunc`] so the session state
//! machine does not change when the credential source does.
//!
//! # Supported mechanisms
//! - PLAIN (RFC 4616): identity, username and password in one exchange
//! - LOGIN: "Username:" then "Password:" challenges
//!
//! # Usage
//! ```
//! use smtpd_proxy::auth::{AuthFunc, HardcodedAuth};
//! use smtpd_proxy::AuthError;
//!
//! let auth = HardcodedAuth::new("mail.example.com", "user@example.com", "password123");
//! assert!(auth.authenticate("", "user@example.com", "password123").is_ok());
//! assert_eq!(
//!     auth.authenticate("other.example.com", "user@example.com", "password123"),
//!     Err(AuthError::InvalidIdentity)
//! );
//! ```

use crate::error::AuthError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
    /// LOGIN mechanism
    Login,
}

impl AuthMechanism {
    /// Parse mechanism from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    /// Get mechanism name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Verifies one (identity, username, password) tuple
///
/// The identity is empty when the client did not send one (always the case
/// for LOGIN).
pub trait AuthFunc: Send + Sync {
    fn authenticate(&self, identity: &str, username: &str, password: &str)
        -> Result<(), AuthError>;
}

impl<F> AuthFunc for F
where
    F: Fn(&str, &str, &str) -> Result<(), AuthError> + Send + Sync,
{
    fn authenticate(
        &self,
        identity: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        self(identity, username, password)
    }
}

/// Rejects every attempt; used when no credentials are configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuth;

impl AuthFunc for NoOpAuth {
    fn authenticate(&self, _: &str, _: &str, _: &str) -> Result<(), AuthError> {
        Err(AuthError::InvalidCredentials)
    }
}

/// Accepts exactly one configured identity/username/password tuple
#[derive(Clone)]
pub struct HardcodedAuth {
    identity: String,
    username: String,
    password: String,
}

impl HardcodedAuth {
    pub fn new(
        identity: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for HardcodedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardcodedAuth")
            .field("identity", &self.identity)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthFunc for HardcodedAuth {
    fn authenticate(
        &self,
        identity: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        if !identity.is_empty() && identity != self.identity {
            return Err(AuthError::InvalidIdentity);
        }

        // Evaluate both so timing does not reveal which one was wrong
        let username_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
        let password_ok = constant_time_eq(password.as_bytes(), self.password.as_bytes());
        if username_ok & password_ok {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Decode PLAIN authentication data
///
/// Format: `identity\0username\0password` (base64 encoded). Returns the
/// three parts in that order; the identity is often empty.
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String, String), AuthError> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| AuthError::Malformed(format!("Invalid base64: {}", e)))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| AuthError::Malformed(format!("Invalid UTF-8: {}", e)))?;

    let parts: Vec<&str> = text.split('\0').collect();
    if parts.len() != 3 {
        return Err(AuthError::Malformed("Invalid PLAIN auth format".to_string()));
    }

    Ok((
        parts[0].to_string(),
        parts[1].to_string(),
        parts[2].to_string(),
    ))
}

/// Decode LOGIN authentication data
///
/// Username and password are sent separately, both base64 encoded
pub fn decode_login_credential(credential: &str) -> Result<String, AuthError> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| AuthError::Malformed(format!("Invalid base64: {}", e)))?;

    String::from_utf8(decoded).map_err(|e| AuthError::Malformed(format!("Invalid UTF-8: {}", e)))
}
