//! smtpd-proxy: SMTP relay with weighted upstream selection
//!
//! Accepts mail over SMTP, optionally requiring PLAIN or LOGIN
//! authentication, and hands every message to exactly one upstream sender
//! picked at random in proportion to its configured weight. The client's
//! DATA reply reflects the outcome of that delivery.
//!
//! # Example
//!
//! ```no_run
//! use smtpd_proxy::config::Config;
//! use smtpd_proxy::smtp::{Backend, ProxyServer, ServerOptions};
//! use smtpd_proxy::upstream::build_registry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("smtpd-proxy.toml")?;
//!     config.validate()?;
//!
//!     let registry = build_registry(&config.upstream)?;
//!     let backend = Backend::new(Arc::new(registry))
//!         .with_anonymous_access(config.server.is_anon_auth_allowed);
//!
//!     let options = ServerOptions {
//!         listen: config.server.listen.clone(),
//!         hostname: config.server.advertised_domain(),
//!         tls: None,
//!     };
//!     ProxyServer::new(options, backend).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: TOML configuration and validation
//! - [`error`]: Error types
//! - [`auth`]: Credential checks
//! - [`envelope`]: Parsed message handed to upstreams
//! - [`upstream`]: Weighted registry and forwarder kinds
//! - [`smtp`]: SMTP server, sessions and wire protocol
//! - [`tls`]: STARTTLS certificate loading

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod smtp;
pub mod tls;
pub mod upstream;

pub use config::Config;
pub use error::{AuthError, ForwardError, ProxyError, Result};
