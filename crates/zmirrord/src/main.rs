//! zmirrord: caching mirror for Zig release artifacts
//!
//! Usage:
//!   zmirrord [--config /etc/zmirror/config.toml] [--cache-dir DIR]
//!            [--upstream-url URL] [--listen ADDR]
//!            [--enable-tls --tls-cert-file PEM --tls-key-file PEM
//!             [--tls-port PORT] [--redirect-to-https]]
//!
//! Artifacts are fetched from the upstream on first request, stored in the
//! cache directory, and served from disk from then on.

mod daemon;
mod metrics;
mod server;
mod tls;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;
use zmirror_core::MirrorConfig;

#[derive(Parser, Debug)]
#[command(name = "zmirrord", version, about = "Caching mirror for Zig release artifacts")]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "ZMIRROR_CONFIG",
        default_value = "/etc/zmirror/config.toml"
    )]
    config: PathBuf,

    /// Directory for cached artifacts (overrides cache.dir)
    #[arg(long, env = "ZMIRROR_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Upstream base URL (overrides upstream.url)
    #[arg(long, env = "ZMIRROR_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// Listen address, e.g. 0.0.0.0:8080 (overrides server.listen)
    #[arg(long, env = "ZMIRROR_LISTEN")]
    listen: Option<String>,

    /// Serve the mirror over HTTPS (overrides server.tls.enabled)
    #[arg(long, env = "ZMIRROR_ENABLE_TLS")]
    enable_tls: bool,

    /// PEM certificate chain (overrides server.tls.cert_file)
    #[arg(long, env = "ZMIRROR_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key (overrides server.tls.key_file)
    #[arg(long, env = "ZMIRROR_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// HTTPS port on the --listen host (overrides server.tls.port)
    #[arg(long, env = "ZMIRROR_TLS_PORT")]
    tls_port: Option<u16>,

    /// Redirect plain HTTP on --listen to HTTPS (overrides server.tls.redirect_http)
    #[arg(long, env = "ZMIRROR_REDIRECT_TO_HTTPS")]
    redirect_to_https: bool,

    /// Log level (trace, debug, info, warn, error); overrides server.log_level
    #[arg(long, env = "ZMIRROR_LOG")]
    log: Option<String>,

    /// Log format; overrides server.log_format
    #[arg(long, env = "ZMIRROR_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = load_config(&cli.config).await?;
    let found = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    apply_overrides(&mut config, &cli);

    // Initialize logging
    let level = cli
        .log
        .clone()
        .unwrap_or_else(|| config.server.log_level.clone());
    let format = cli
        .log_format
        .clone()
        .or_else(|| LogFormat::from_str(&config.server.log_format, true).ok())
        .unwrap_or(LogFormat::Text);
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "zmirrord starting"
    );
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    daemon::run(config).await
}

/// Read the config file. `None` if it does not exist.
async fn load_config(path: &Path) -> Result<Option<MirrorConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = MirrorConfig::from_toml_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(Some(config))
}

fn apply_overrides(config: &mut MirrorConfig, cli: &Cli) {
    if let Some(dir) = &cli.cache_dir {
        config.cache.dir = dir.clone();
    }
    if let Some(url) = &cli.upstream_url {
        config.upstream.url = url.clone();
    }
    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }

    let tls = &mut config.server.tls;
    tls.enabled |= cli.enable_tls;
    tls.redirect_http |= cli.redirect_to_https;
    if let Some(cert) = &cli.tls_cert_file {
        tls.cert_file = Some(cert.clone());
    }
    if let Some(key) = &cli.tls_key_file {
        tls.key_file = Some(key.clone());
    }
    if let Some(port) = cli.tls_port {
        tls.port = port;
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Text => builder.init(),
    }
}
