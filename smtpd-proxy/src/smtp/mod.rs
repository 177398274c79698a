//! SMTP front end (RFC 5321, RFC 4954, RFC 3207)
//!
//! - [`server`]: accept loop and graceful shutdown
//! - [`connection`]: wire protocol for one client
//! - [`backend`]: session factory and authorization state
//! - [`commands`]: command line parsing

pub mod backend;
pub mod commands;
pub mod connection;
pub mod server;

pub use backend::{Backend, Session};
pub use commands::SmtpCommand;
pub use connection::{Connection, MAX_MESSAGE_SIZE};
pub use server::{ProxyServer, ServerOptions};
