//! `smtp-relay` upstream: re-sends the raw message through another SMTP server
//!
//! Settings:
//!
//! | key | default | |
//! |---|---|---|
//! | `addr` | required | `host:port` of the relay |
//! | `auth` | `anon` | `plain`, `login` or `anon` |
//! | `username` / `password` | empty | used unless `auth = "anon"` |
//! | `host` | host part of `addr` | TLS server name |
//! | `tls` | `opportunistic` | `opportunistic`, `required`, `wrapper` or `none` |

use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Deserialize;
use tracing::debug;

use super::{decode_settings, Forward, ForwardContext, UpstreamKind};
use crate::config::{split_host_port, Settings};
use crate::envelope::Envelope;
use crate::error::{ForwardError, ProxyError, Result};

#[derive(Debug, Deserialize)]
struct RelaySettings {
    addr: String,
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    tls: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayAuth {
    Plain,
    Login,
    Anonymous,
}

impl RelayAuth {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "login" => Ok(Self::Login),
            "anon" | "" => Ok(Self::Anonymous),
            _ => Err(ProxyError::Config(format!(
                "unrecognized auth type: {}, supported values [login, plain, anon]",
                value
            ))),
        }
    }

    fn mechanism(self) -> Option<Mechanism> {
        match self {
            Self::Plain => Some(Mechanism::Plain),
            Self::Login => Some(Mechanism::Login),
            Self::Anonymous => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayTls {
    Opportunistic,
    Required,
    Wrapper,
    Disabled,
}

impl RelayTls {
    fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "opportunistic" | "" => Ok(Self::Opportunistic),
            "required" => Ok(Self::Required),
            "wrapper" => Ok(Self::Wrapper),
            "none" => Ok(Self::Disabled),
            _ => Err(ProxyError::Config(format!(
                "unrecognized tls mode: {}, supported values [opportunistic, required, wrapper, none]",
                value
            ))),
        }
    }
}

/// Relays messages through a remote SMTP server.
///
/// The transport and its connection pool are built once and shared by every
/// delivery.
pub struct SmtpRelay {
    addr: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpRelay").field("addr", &self.addr).finish()
    }
}

impl SmtpRelay {
    pub fn configure(settings: &Settings) -> Result<Self> {
        let settings: RelaySettings = decode_settings(UpstreamKind::SmtpRelay, settings)?;

        let auth = RelayAuth::parse(&settings.auth)?;
        let tls_mode = RelayTls::parse(&settings.tls)?;

        let (relay_host, port) = split_host_port(&settings.addr)
            .ok_or_else(|| ProxyError::Config(format!("invalid relay address: {}", settings.addr)))?;
        let tls_name = if settings.host.is_empty() {
            relay_host.clone()
        } else {
            settings.host.clone()
        };

        let tls = match tls_mode {
            RelayTls::Disabled => Tls::None,
            mode => {
                let parameters = TlsParameters::new(tls_name).map_err(|e| {
                    ProxyError::Config(format!("invalid TLS parameters for relay: {}", e))
                })?;
                match mode {
                    RelayTls::Required => Tls::Required(parameters),
                    RelayTls::Wrapper => Tls::Wrapper(parameters),
                    _ => Tls::Opportunistic(parameters),
                }
            }
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay_host)
            .port(port)
            .tls(tls);
        if let Some(mechanism) = auth.mechanism() {
            builder = builder
                .credentials(Credentials::new(settings.username, settings.password))
                .authentication(vec![mechanism]);
        }

        Ok(Self {
            addr: settings.addr,
            transport: builder.build(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// SMTP envelope from the message headers: From as sender, To/Cc/Bcc as
/// recipients
fn smtp_envelope(envelope: &Envelope) -> std::result::Result<lettre::address::Envelope, ForwardError> {
    let from = envelope.from.as_deref().ok_or(ForwardError::MissingSender)?;
    let from = parse_address(from)?;

    let recipients = envelope
        .recipients()
        .map(parse_address)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if recipients.is_empty() {
        return Err(ForwardError::MissingRecipients);
    }

    lettre::address::Envelope::new(Some(from), recipients)
        .map_err(|e| ForwardError::Smtp(e.to_string()))
}

fn parse_address(address: &str) -> std::result::Result<lettre::Address, ForwardError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| ForwardError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Forward for SmtpRelay {
    async fn forward(
        &self,
        ctx: &ForwardContext,
        envelope: &Envelope,
    ) -> std::result::Result<(), ForwardError> {
        let smtp_envelope = smtp_envelope(envelope)?;
        debug!(uid = %ctx.uid(), relay = %self.addr, "relaying message");

        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(ForwardError::Cancelled),
            result = self.transport.send_raw(&smtp_envelope, &envelope.raw) => {
                result
                    .map(|_| ())
                    .map_err(|e| ForwardError::Smtp(e.to_string()))
            }
        }
    }
}
