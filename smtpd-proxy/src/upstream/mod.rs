//! Upstream senders
//!
//! - [`registry`]: weighted selection of one forwarder per message
//! - [`smtp_relay`]: relay through another SMTP server
//! - [`ses`]: AWS SES v2 HTTP API (`cloud-email-api`)
//! - [`log_sink`]: log and discard

pub mod log_sink;
pub mod registry;
pub mod ses;
pub mod sigv4;
pub mod smtp_relay;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Settings, UpstreamConfig};
use crate::envelope::Envelope;
use crate::error::{ForwardError, ProxyError, Result};

pub use log_sink::LogSink;
pub use registry::{OsRandom, RandomSource, Registry};
pub use ses::SesForwarder;
pub use smtp_relay::SmtpRelay;

/// Identifies the registry entry that handles one delivery attempt.
/// Only used for log correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionMeta {
    pub uid: String,
}

/// Per-call context handed to [`Forward::forward`]
#[derive(Debug, Clone)]
pub struct ForwardContext {
    pub selection: SelectionMeta,
    /// Fires when the originating connection ends or the server shuts down
    pub cancellation: CancellationToken,
}

impl ForwardContext {
    pub fn new(uid: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            selection: SelectionMeta { uid: uid.into() },
            cancellation,
        }
    }

    pub fn uid(&self) -> &str {
        &self.selection.uid
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Delivery of one parsed message to one upstream.
///
/// Implementations are called concurrently from many connections and keep no
/// mutable per-call state.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(
        &self,
        ctx: &ForwardContext,
        envelope: &Envelope,
    ) -> std::result::Result<(), ForwardError>;
}

/// Provider type tag of an `[[upstream]]` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamKind {
    SmtpRelay,
    CloudEmailApi,
    LogSink,
}

impl UpstreamKind {
    pub const ALL: [UpstreamKind; 3] = [Self::SmtpRelay, Self::CloudEmailApi, Self::LogSink];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmtpRelay => "smtp-relay",
            Self::CloudEmailApi => "cloud-email-api",
            Self::LogSink => "log-sink",
        }
    }

    /// Comma separated list of accepted tags
    pub fn supported() -> String {
        Self::ALL
            .iter()
            .map(UpstreamKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpstreamKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unrecognized server type: {}. allowed values: {}",
                    s,
                    Self::supported()
                )
            })
    }
}

/// The closed set of upstream senders
pub enum Forwarder {
    SmtpRelay(SmtpRelay),
    CloudEmailApi(SesForwarder),
    LogSink(LogSink),
}

impl Forwarder {
    /// Bind provider specific settings; called once per entry at startup
    pub fn configure(kind: UpstreamKind, settings: &Settings) -> Result<Self> {
        match kind {
            UpstreamKind::SmtpRelay => SmtpRelay::configure(settings).map(Self::SmtpRelay),
            UpstreamKind::CloudEmailApi => {
                SesForwarder::configure(settings).map(Self::CloudEmailApi)
            }
            UpstreamKind::LogSink => Ok(Self::LogSink(LogSink)),
        }
    }

    pub fn kind(&self) -> UpstreamKind {
        match self {
            Self::SmtpRelay(_) => UpstreamKind::SmtpRelay,
            Self::CloudEmailApi(_) => UpstreamKind::CloudEmailApi,
            Self::LogSink(_) => UpstreamKind::LogSink,
        }
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Forwarder").field(&self.kind()).finish()
    }
}

#[async_trait]
impl Forward for Forwarder {
    async fn forward(
        &self,
        ctx: &ForwardContext,
        envelope: &Envelope,
    ) -> std::result::Result<(), ForwardError> {
        match self {
            Self::SmtpRelay(relay) => relay.forward(ctx, envelope).await,
            Self::CloudEmailApi(ses) => ses.forward(ctx, envelope).await,
            Self::LogSink(sink) => sink.forward(ctx, envelope).await,
        }
    }
}

/// Deserialize a settings map into a provider settings struct
pub(crate) fn decode_settings<T: DeserializeOwned>(
    kind: UpstreamKind,
    settings: &Settings,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(settings.clone()))
        .map_err(|e| ProxyError::Config(format!("invalid {} settings: {}", kind, e)))
}

/// Configure every upstream entry and load them into a new registry.
///
/// Problems with individual entries are collected and reported together.
pub fn build_registry(upstreams: &[UpstreamConfig]) -> Result<Registry> {
    let registry = Registry::new();
    let mut errors = Vec::new();

    for (index, upstream) in upstreams.iter().enumerate() {
        let position = index + 1;

        let kind = match upstream.upstream_kind() {
            Ok(kind) => kind,
            Err(e) => {
                errors.push(format!("upstream #{}: {}", position, e));
                continue;
            }
        };

        let weight = match upstream.checked_weight() {
            Ok(weight) => weight,
            Err(e) => {
                errors.push(format!("upstream #{} ({}): {}", position, kind, e));
                continue;
            }
        };

        match Forwarder::configure(kind, &upstream.settings) {
            Ok(forwarder) => {
                registry.add_forwarder(forwarder, weight);
                info!(upstream = position, kind = %kind, weight = weight.get(), "upstream configured");
            }
            Err(e) => errors.push(format!("upstream #{} ({}): {}", position, kind, e)),
        }
    }

    if !errors.is_empty() {
        if registry.is_empty() {
            errors.push(ProxyError::EmptyRegistry.to_string());
        }
        return Err(ProxyError::InvalidConfig(errors));
    }

    if registry.is_empty() {
        return Err(ProxyError::EmptyRegistry);
    }

    Ok(registry)
}
