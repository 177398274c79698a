//! Configuration for smtpd-proxy
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:1025"
//! ehlo = "mail.example.com"
//! username = "user@example.com"
//! password = "secret"
//! is_anon_auth_allowed = false
//! server_cert = "server.crt"
//! server_key = "server.key"
//!
//! [[upstream]]
//! type = "smtp-relay"
//! weight = 25
//! [upstream.settings]
//! addr = "smtp.example.com:587"
//! auth = "plain"
//! username = "relay"
//! password = "secret"
//!
//! [[upstream]]
//! type = "log-sink"
//! weight = 1
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ProxyError, Result};
use crate::upstream::UpstreamKind;

/// Free-form provider specific settings of one upstream entry
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Main proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream senders, in registry insertion order
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:1025")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Advertised domain, also the identity accepted during AUTH
    #[serde(default)]
    pub ehlo: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub is_anon_auth_allowed: bool,
    /// Path to PEM certificate chain
    pub server_cert: Option<String>,
    /// Path to PEM private key
    pub server_key: Option<String>,
}

/// One weighted upstream sender
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Provider type tag: smtp-relay, cloud-email-api or log-sink
    #[serde(rename = "type", default = "default_upstream_type")]
    pub kind: String,
    /// Relative selection weight, must be positive
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub settings: Settings,
}

fn default_listen() -> String {
    "127.0.0.1:1025".to_string()
}

fn default_upstream_type() -> String {
    UpstreamKind::SmtpRelay.as_str().to_string()
}

fn default_weight() -> i64 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ehlo: String::new(),
            username: String::new(),
            password: String::new(),
            is_anon_auth_allowed: false,
            server_cert: None,
            server_key: None,
        }
    }
}

impl ServerConfig {
    /// Domain used in the greeting and EHLO reply; falls back to the listen host
    pub fn advertised_domain(&self) -> String {
        if !self.ehlo.is_empty() {
            return self.ehlo.clone();
        }
        split_host_port(&self.listen)
            .map(|(host, _)| host)
            .unwrap_or_else(|| self.listen.clone())
    }

    /// Certificate and key paths, when both are configured
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (self.server_cert.as_deref(), self.server_key.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(ProxyError::Config("empty configuration file".to_string()));
        }

        toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    ///
    /// Every upstream entry is checked and all problems are returned together.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.is_empty() {
            return Err(ProxyError::Config(format!(
                "no upstream servers configured, supported types: {}",
                UpstreamKind::supported()
            )));
        }

        let mut errors = Vec::new();

        if split_host_port(&self.server.listen).is_none() {
            errors.push(format!("invalid listen address: {}", self.server.listen));
        }

        let has_cert = self.server.server_cert.as_deref().is_some_and(|p| !p.is_empty());
        let has_key = self.server.server_key.as_deref().is_some_and(|p| !p.is_empty());
        if has_cert != has_key {
            errors.push("server_cert and server_key must be set together".to_string());
        }

        for (index, upstream) in self.upstream.iter().enumerate() {
            if let Err(e) = upstream.upstream_kind() {
                errors.push(format!("upstream #{}: {}", index + 1, e));
            }
            if let Err(e) = upstream.checked_weight() {
                errors.push(format!("upstream #{}: {}", index + 1, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::InvalidConfig(errors))
        }
    }
}

impl UpstreamConfig {
    /// Parsed provider type tag
    pub fn upstream_kind(&self) -> std::result::Result<UpstreamKind, String> {
        self.kind.parse()
    }

    /// Weight as accepted by the registry
    pub fn checked_weight(&self) -> std::result::Result<std::num::NonZeroU32, String> {
        if self.weight <= 0 {
            return Err(format!("invalid non-positive weight: {}", self.weight));
        }
        u32::try_from(self.weight)
            .ok()
            .and_then(std::num::NonZeroU32::new)
            .ok_or_else(|| format!("weight {} exceeds maximum of {}", self.weight, u32::MAX))
    }
}

/// Split "host:port" (or "[v6]:port") into its parts
pub(crate) fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
