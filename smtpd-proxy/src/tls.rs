//! Server-side TLS for STARTTLS
//!
//! Loads a PEM certificate chain and private key into a rustls
//! [`ServerConfig`] shared by every connection.

use crate::error::{ProxyError, Result};
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// TLS configuration offered through STARTTLS
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<Item>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("Failed to open {} file {:?}: {}", what, path, e)))?;
    rustls_pemfile::read_all(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("Failed to read {} file {:?}: {}", what, path, e)))
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    ///
    /// The key may be PKCS#8, PKCS#1 (RSA) or SEC1 (EC); the first one in
    /// the file is used.
    ///
    /// ```no_run
    /// use smtpd_proxy::tls::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls = TlsConfig::from_pem_files("/etc/smtpd/cert.pem", "/etc/smtpd/key.pem")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let certs: Vec<rustls::Certificate> = read_pem(cert_path.as_ref(), "certificate")?
            .into_iter()
            .filter_map(|item| match item {
                Item::X509Certificate(der) => Some(rustls::Certificate(der)),
                _ => None,
            })
            .collect();

        if certs.is_empty() {
            return Err(ProxyError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let private_key = read_pem(key_path.as_ref(), "key")?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                    Some(rustls::PrivateKey(der))
                }
                _ => None,
            })
            .ok_or_else(|| ProxyError::Tls("No private key found in file".to_string()))?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Acceptor used to upgrade a plain connection after STARTTLS
    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(Arc::clone(&self.server_config))
    }
}
