//! TLS bootstrap.
//!
//! Certificate material is typically dropped into place by a separate
//! provisioning agent, so startup waits for the file with a filesystem watch
//! rather than polling. One rustls server context is built once and shared,
//! immutable, by every connection. Disabling TLS is an explicit insecure
//! opt-in in the configuration, never a fallback.

use notify::Watcher;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("timed out after {timeout:?} waiting for {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("filesystem watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("failed to read certificate file: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificates found in PEM file")]
    NoCertificates,

    #[error("no private key found in PEM file")]
    NoPrivateKey,

    #[error("cipher suite policy matched no supported suites: {0}")]
    NoCipherSuites(String),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Block until `path` exists or `timeout` elapses, using a filesystem watch
/// on the parent directory instead of polling.
///
/// Existence is re-checked immediately after the watch is registered, so a
/// file created between the first check and the watch registration is not
/// missed.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> Result<(), TlsError> {
    if path.exists() {
        return Ok(());
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(
        move |event: Result<notify::Event, notify::Error>| {
            if event.is_ok() {
                let _ = tx.send(());
            }
        },
    )?;

    watcher.watch(parent, notify::RecursiveMode::NonRecursive)?;

    // re-check: the file may have appeared before the watch was in place
    if path.exists() {
        return Ok(());
    }

    info!(path = %path.display(), ?timeout, "waiting for certificate file");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(())) => {
                if path.exists() {
                    debug!(path = %path.display(), "certificate file appeared");
                    return Ok(());
                }
            }
            // watcher thread went away; surface as a watch failure
            Ok(None) => {
                return Err(TlsError::Watch(notify::Error::generic(
                    "filesystem watcher terminated",
                )))
            }
            Err(_) => {
                return Err(TlsError::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                })
            }
        }
    }
}

/// Build the shared server context from a combined PEM file (certificate
/// chain followed by the private key).
///
/// `ciphersuites` is a colon-separated list of suite names (matched against
/// the ring provider's supported set, case-insensitive); `None` or an empty
/// policy keeps the provider defaults.
pub fn build_server_config(
    certfile: &Path,
    ciphersuites: Option<&str>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = {
        let mut reader = BufReader::new(std::fs::File::open(certfile)?);
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<CertificateDer>, _>>()?
    };
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }

    let key: PrivateKeyDer = {
        let mut reader = BufReader::new(std::fs::File::open(certfile)?);
        rustls_pemfile::private_key(&mut reader)?.ok_or(TlsError::NoPrivateKey)?
    };

    let provider = provider_with_policy(ciphersuites)?;
    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    info!(certfile = %certfile.display(), "TLS server context ready");
    Ok(Arc::new(config))
}

fn provider_with_policy(ciphersuites: Option<&str>) -> Result<CryptoProvider, TlsError> {
    let mut provider = rustls::crypto::ring::default_provider();

    let policy = match ciphersuites {
        Some(p) if !p.trim().is_empty() => p,
        _ => return Ok(provider),
    };

    let wanted: Vec<&str> = policy.split(':').map(str::trim).filter(|s| !s.is_empty()).collect();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        wanted.iter().any(|w| name.eq_ignore_ascii_case(w))
    });

    if provider.cipher_suites.is_empty() {
        return Err(TlsError::NoCipherSuites(policy.to_string()));
    }
    debug!(suites = provider.cipher_suites.len(), "cipher suite policy applied");
    Ok(provider)
}
