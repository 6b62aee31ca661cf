use crate::config::Settings;
use crate::control::HttpControlPlane;
use crate::identity::HttpIdentityService;
use crate::lease::recovery;
use crate::lease::registry::LeaseRegistry;
use crate::nbd::{GatewayContext, NbdServer};
use crate::task::spawn_named;
use crate::tls;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_server(config_path: PathBuf) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Starting volnbd gateway");

    let registry = Arc::new(
        LeaseRegistry::open(&settings.registry.dir).with_context(|| {
            format!(
                "Failed to open lease registry at {}",
                settings.registry.dir.display()
            )
        })?,
    );
    info!("Lease registry at {}", registry.dir().display());

    let identity_url = settings
        .identity
        .url
        .parse()
        .context("Invalid identity.url")?;
    let control_url = settings.control.url.parse().context("Invalid control.url")?;
    let identity = Arc::new(HttpIdentityService::new(identity_url));
    let control = Arc::new(HttpControlPlane::new(control_url));

    // Reconcile whatever a previous process left behind before accepting
    // anything. An unreadable registry is fatal here: recovery cannot proceed.
    recovery::sweep(registry.as_ref(), control.as_ref())
        .await
        .context("Crash recovery sweep failed")?;

    let acceptor = if settings.tls.no_tls {
        warn!("TLS disabled by configuration; serving plaintext");
        None
    } else {
        let certfile = match settings.tls.certfile.as_ref() {
            Some(path) => path,
            None => anyhow::bail!("tls.certfile is required unless tls.no_tls is set"),
        };
        tls::wait_for_file(certfile, Duration::from_secs(settings.tls.cert_wait_secs))
            .await
            .context("TLS certificate never appeared")?;
        let config = tls::build_server_config(certfile, settings.tls.ciphersuites.as_deref())
            .context("Failed to build TLS server context")?;
        Some(TlsAcceptor::from(config))
    };

    let ctx = Arc::new(GatewayContext::new(
        identity,
        Arc::clone(&control) as Arc<dyn crate::control::ControlPlane>,
        Arc::clone(&registry),
        acceptor,
    ));

    let address = settings
        .listen
        .address
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(address, settings.listen.port);
    let server = NbdServer::new(ctx, addr);

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let mut accept_handle =
        spawn_named("nbd-accept", async move { server.start(shutdown_clone).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, initiating graceful shutdown...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown...");
                break;
            }
            result = &mut accept_handle => {
                // the accept loop must not fail for reasons a restart cannot
                // fix; treat its escape as an unrecoverable invariant violation
                match result {
                    Ok(Ok(())) => error!("Accept loop exited unexpectedly"),
                    Ok(Err(e)) => error!("Accept loop failed: {}", e),
                    Err(e) => error!("Accept loop panicked: {}", e),
                }
                shutdown_sweep(&registry, control.as_ref()).await;
                anyhow::bail!("accept loop terminated unexpectedly");
            }
        }
    }

    shutdown.cancel();
    let _ = accept_handle.await;

    // same sweep as startup, synchronously, before the process exits
    shutdown_sweep(&registry, control.as_ref()).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_sweep(registry: &LeaseRegistry, control: &HttpControlPlane) {
    info!("Running shutdown sweep over lease registry");
    if let Err(e) = recovery::sweep(registry, control).await {
        error!("Shutdown sweep failed: {}", e);
    }
}
