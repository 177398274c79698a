use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use smtpd_proxy::auth::{HardcodedAuth, NoOpAuth};
use smtpd_proxy::config::Config;
use smtpd_proxy::smtp::{Backend, ProxyServer, ServerOptions};
use smtpd_proxy::tls::TlsConfig;
use smtpd_proxy::upstream::build_registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// SMTP relay that spreads accepted mail over weighted upstream senders
#[derive(Debug, Parser)]
#[command(version, about)]
struct Opts {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, env = "SMTPD_CONFIG", default_value = "smtpd-proxy.toml")]
    configuration: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let default_filter = if opts.verbose {
        "smtpd_proxy=debug,info"
    } else {
        "smtpd_proxy=info,warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting smtpd-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(&opts.configuration)
        .with_context(|| format!("loading {}", opts.configuration.display()))?;
    config.validate()?;

    let tls = match config.server.tls_paths() {
        Some((cert, key)) => Some(TlsConfig::from_pem_files(cert, key)?),
        None => None,
    };

    let registry = build_registry(&config.upstream)?;
    info!(
        upstreams = registry.len(),
        total_weight = registry.total_weight(),
        "Sender registry ready"
    );

    let hostname = config.server.advertised_domain();
    let backend = Backend::new(Arc::new(registry))
        .with_anonymous_access(config.server.is_anon_auth_allowed);
    let backend = if config.server.username.is_empty() {
        if !config.server.is_anon_auth_allowed {
            warn!("No username configured and anonymous access disabled; every submission will be refused");
        }
        backend.with_auth(NoOpAuth)
    } else {
        backend.with_auth(HardcodedAuth::new(
            hostname.clone(),
            config.server.username.clone(),
            config.server.password.clone(),
        ))
    };

    let server = ProxyServer::new(
        ServerOptions {
            listen: config.server.listen.clone(),
            hostname,
            tls,
        },
        backend,
    );

    tokio::spawn(shutdown_on_signal(server.backend().shutdown_token().clone()));

    server.run().await?;
    Ok(())
}

async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    token.cancel();
}
