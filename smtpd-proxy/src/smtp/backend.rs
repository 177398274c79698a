//! Session factory and per-connection authorization state
//!
//! A [`Session`] starts unauthenticated. A successful PLAIN or LOGIN
//! exchange authorizes it; a failed one leaves it unauthorized and the client
//! may retry as often as it likes. MAIL, RCPT and DATA are only accepted
//! when the session is authorized or the backend allows anonymous access.
//!
//! On DATA the payload is parsed and forwarded through the registry before
//! the call returns, so the client sees the upstream's result.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthFunc, AuthMechanism, NoOpAuth};
use crate::envelope::Envelope;
use crate::error::{AuthError, ProxyError, Result};
use crate::upstream::{Forward, Forwarder, Registry};

// No SASL ANONYMOUS: anonymous access is a backend flag checked on
// MAIL/RCPT/DATA, and AUTH ANONYMOUS gets 504.
const MECHANISMS: [AuthMechanism; 2] = [AuthMechanism::Plain, AuthMechanism::Login];

/// Shared configuration every session is created from
pub struct Backend<F = Forwarder> {
    registry: Arc<Registry<F>>,
    auth: Arc<dyn AuthFunc>,
    anonymous_allowed: bool,
    shutdown: CancellationToken,
}

impl<F> Clone for Backend<F> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            auth: Arc::clone(&self.auth),
            anonymous_allowed: self.anonymous_allowed,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<F: Forward> Backend<F> {
    /// Backend that rejects every credential and requires authentication
    pub fn new(registry: Arc<Registry<F>>) -> Self {
        Self {
            registry,
            auth: Arc::new(NoOpAuth),
            anonymous_allowed: false,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_auth(mut self, auth: impl AuthFunc + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_anonymous_access(mut self, allowed: bool) -> Self {
        self.anonymous_allowed = allowed;
        self
    }

    /// Cancelling this token cancels every session's in-flight delivery
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn registry(&self) -> &Arc<Registry<F>> {
        &self.registry
    }

    pub fn anonymous_allowed(&self) -> bool {
        self.anonymous_allowed
    }

    pub fn new_session(&self, peer: Option<SocketAddr>) -> Session<F> {
        Session {
            registry: Arc::clone(&self.registry),
            auth: Arc::clone(&self.auth),
            anonymous_allowed: self.anonymous_allowed,
            authorized: false,
            username: None,
            peer,
            cancellation: self.shutdown.child_token(),
        }
    }
}

/// Authorization state of one client connection
pub struct Session<F = Forwarder> {
    registry: Arc<Registry<F>>,
    auth: Arc<dyn AuthFunc>,
    anonymous_allowed: bool,
    authorized: bool,
    /// Kept for logging only
    username: Option<String>,
    peer: Option<SocketAddr>,
    cancellation: CancellationToken,
}

impl<F: Forward> Session<F> {
    /// Mechanisms offered in the EHLO reply
    pub fn auth_mechanisms(&self) -> &'static [AuthMechanism] {
        &MECHANISMS
    }

    pub fn auth_mechanism(&self, name: &str) -> Result<AuthMechanism> {
        AuthMechanism::from_str(name)
            .filter(|m| MECHANISMS.contains(m))
            .ok_or_else(|| AuthError::UnsupportedMechanism.into())
    }

    pub fn auth_plain(&mut self, identity: &str, username: &str, password: &str) -> Result<()> {
        self.authenticate(AuthMechanism::Plain, identity, username, password)
    }

    /// LOGIN carries no identity
    pub fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        self.authenticate(AuthMechanism::Login, "", username, password)
    }

    fn authenticate(
        &mut self,
        mechanism: AuthMechanism,
        identity: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        match self.auth.authenticate(identity, username, password) {
            Ok(()) => {
                info!(peer = ?self.peer, username, mechanism = mechanism.as_str(), "authentication successful");
                self.authorized = true;
                self.username = Some(username.to_string());
                Ok(())
            }
            Err(e) => {
                warn!(peer = ?self.peer, username, mechanism = mechanism.as_str(), error = %e, "authentication failed");
                self.authorized = false;
                self.username = None;
                Err(e.into())
            }
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Whether MAIL, RCPT and DATA are currently accepted
    pub fn may_submit(&self) -> bool {
        self.anonymous_allowed || self.authorized
    }

    fn check_authorized(&self) -> Result<()> {
        if self.may_submit() {
            Ok(())
        } else {
            Err(ProxyError::Unauthorized)
        }
    }

    pub fn mail(&self, from: &str) -> Result<()> {
        self.check_authorized()?;
        debug!(peer = ?self.peer, from, "mail from");
        Ok(())
    }

    pub fn rcpt(&self, to: &str) -> Result<()> {
        self.check_authorized()?;
        debug!(peer = ?self.peer, to, "rcpt to");
        Ok(())
    }

    /// Parse the DATA payload and deliver it through one upstream
    pub async fn data(&self, raw: &[u8]) -> Result<()> {
        self.check_authorized()?;

        let envelope = Envelope::parse(raw).map_err(|e| {
            warn!(peer = ?self.peer, error = %e, "dropping unparseable message");
            e
        })?;

        self.registry.forward(&self.cancellation, &envelope).await?;
        info!(
            peer = ?self.peer,
            username = self.username.as_deref().unwrap_or(""),
            size = raw.len(),
            "message forwarded"
        );
        Ok(())
    }

    pub fn reset(&self) {
        debug!(peer = ?self.peer, "session reset");
    }

    pub fn logout(&mut self) {
        debug!(peer = ?self.peer, "session logout");
        self.authorized = false;
        self.username = None;
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl<F> Drop for Session<F> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
