use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::smtp::backend::Backend;
use crate::smtp::connection::Connection;
use crate::tls::TlsConfig;
use crate::upstream::{Forward, Forwarder};

/// How long open sessions get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: String,
    /// Name used in the greeting and EHLO reply
    pub hostname: String,
    /// Enables STARTTLS
    pub tls: Option<TlsConfig>,
}

pub struct ProxyServer<F = Forwarder> {
    options: ServerOptions,
    backend: Backend<F>,
}

impl<F: Forward + 'static> ProxyServer<F> {
    pub fn new(options: ServerOptions, backend: Backend<F>) -> Self {
        Self { options, backend }
    }

    pub fn backend(&self) -> &Backend<F> {
        &self.backend
    }

    /// Ask the accept loop and every open session to stop
    pub fn shutdown(&self) {
        self.backend.shutdown_token().cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.options.listen).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            starttls = self.options.tls.is_some(),
            anonymous = self.backend.anonymous_allowed(),
            upstreams = self.backend.registry().len(),
            "SMTP proxy listening"
        );

        let shutdown = self.backend.shutdown_token().clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New SMTP connection from {}", addr);
                        self.spawn_session(&mut sessions, socket, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                // Reap finished sessions so the set does not grow unbounded
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        drop(listener);
        info!(open = sessions.len(), "Shutting down, waiting for open sessions");

        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(open = sessions.len(), "Grace period elapsed, aborting sessions");
            sessions.shutdown().await;
        }

        info!("SMTP proxy stopped");
        Ok(())
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        socket: tokio::net::TcpStream,
        addr: SocketAddr,
    ) {
        let session = self.backend.new_session(Some(addr));
        let connection = Connection::new(session, self.options.hostname.clone(), self.options.tls.clone());
        let span = info_span!("smtp_session", id = %Uuid::new_v4(), peer = %addr);

        sessions.spawn(
            async move {
                if let Err(e) = connection.handle(socket).await {
                    error!("Session error: {}", e);
                }
            }
            .instrument(span),
        );
    }
}
