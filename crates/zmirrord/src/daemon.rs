//! Daemon lifecycle: startup, metrics endpoint, mirror server, shutdown

use anyhow::{bail, Context, Result};
use axum::Router;
use axum_server::Handle;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use zmirror_cache::{build_client, ArtifactCache};
use zmirror_core::MirrorConfig;

use crate::metrics::{HealthState, MirrorMetrics};
use crate::server::{self, AppState};

pub async fn run(config: MirrorConfig) -> Result<()> {
    info!("daemon starting");

    config.validate().context("invalid configuration")?;

    // ── Cache directory ──────────────────────────────────────────────────
    let cache_dir = config.cache.dir.clone();
    tokio::fs::create_dir_all(&cache_dir)
        .await
        .with_context(|| format!("creating cache dir {}", cache_dir.display()))?;

    // One client for the life of the process: pooled connections, bounded timeout
    let client = build_client(&config.upstream).context("building upstream HTTP client")?;
    let cache = Arc::new(ArtifactCache::from_config(&config, client));

    if config.cache.sweep_scratch_on_start {
        match cache.sweep_scratch().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "removed stale scratch files"),
            Err(e) => warn!(dir = %cache_dir.display(), "scratch sweep failed: {e}"),
        }
    }

    // ── Metrics ──────────────────────────────────────────────────────────
    let mut registry = Registry::default();
    let metrics = MirrorMetrics::new(&mut registry);
    let registry = Arc::new(registry);

    if let Some(addr) = config.server.metrics_addr.clone() {
        let state = HealthState {
            registry: registry.clone(),
            cache_dir: cache_dir.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    // ── Mirror server ────────────────────────────────────────────────────
    let app = server::router(AppState { cache, metrics }, config.server.max_body_bytes);
    let grace = config.server.shutdown_grace();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();

    let tls = &config.server.tls;
    if tls.enabled {
        let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) else {
            bail!("server.tls.enabled requires both cert_file and key_file");
        };
        let rustls = crate::tls::load_rustls_config(cert, key)?;
        let tls_listen = config.server.tls_listen();
        let addr = tokio::net::lookup_host(&tls_listen)
            .await
            .with_context(|| format!("resolving {tls_listen}"))?
            .next()
            .with_context(|| format!("no address for {tls_listen}"))?;

        let handle = Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            let shutdown = shutdown_rx.clone();
            async move {
                shutdown_requested(shutdown).await;
                handle.graceful_shutdown(Some(grace));
            }
        });

        info!(
            addr = %addr,
            upstream = %config.upstream.url,
            cache_dir = %cache_dir.display(),
            "mirror: listening (https)"
        );
        servers.spawn(async move {
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .context("https server")
        });

        if tls.redirect_http {
            let listener = bind(&config.server.listen).await?;
            info!(addr = %config.server.listen, tls_port = tls.port, "redirect: listening");
            servers.spawn(serve_plain(
                listener,
                crate::tls::redirect_router(tls.port),
                shutdown_rx.clone(),
            ));
        }
    } else {
        let listener = bind(&config.server.listen).await?;
        info!(
            addr = %config.server.listen,
            upstream = %config.upstream.url,
            cache_dir = %cache_dir.display(),
            "mirror: listening"
        );
        servers.spawn(serve_plain(listener, app, shutdown_rx.clone()));
    }

    tokio::spawn(shutdown_on_signal(shutdown_tx, grace));

    while let Some(joined) = servers.join_next().await {
        joined.context("server task panicked")??;
    }

    info!("server exited gracefully");
    Ok(())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

async fn serve_plain(
    listener: TcpListener,
    app: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_requested(shutdown))
    .await
    .context("http server")
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Waits for SIGINT or SIGTERM, tells every listener to drain, and arms a
/// hard exit in case in-flight requests (long downloads) outlast `grace`.
async fn shutdown_on_signal(shutdown: watch::Sender<bool>, grace: Duration) {
    wait_for_signal().await;
    info!(grace_secs = grace.as_secs(), "shutdown signal received, draining requests");
    let _ = shutdown.send(true);

    tokio::time::sleep(grace).await;
    warn!("hard shutdown initiated");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("registering SIGTERM handler failed: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl-C");
}
