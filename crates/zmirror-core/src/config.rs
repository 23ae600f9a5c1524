use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MirrorError, MirrorResult};

/// Top-level daemon configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address for the mirror (default: 0.0.0.0:8080)
    pub listen: String,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,
    /// Seconds to wait for in-flight requests after a shutdown signal
    pub shutdown_grace_secs: u64,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// HTTPS listener and HTTP redirect
    pub tls: TlsConfig,
}

/// When enabled, the mirror is served over HTTPS on the `listen` host at
/// `port`, and `listen` itself only carries the optional redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM certificate chain
    pub cert_file: Option<PathBuf>,
    /// PEM private key
    pub key_file: Option<PathBuf>,
    /// HTTPS port (default: 443)
    pub port: u16,
    /// Answer plain HTTP on `listen` with a 301 to the HTTPS listener
    pub redirect_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding published artifacts and in-progress scratch files
    pub dir: PathBuf,
    /// Delete scratch files left behind by a previous run at startup
    pub sweep_scratch_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the origin (default: https://ziglang.org)
    pub url: String,
    /// Ceiling for one whole download, connect through last body byte
    pub timeout_secs: u64,
    /// How long pooled upstream connections may sit idle
    pub idle_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// HTTPS listen address: the host part of `listen` with `tls.port`.
    pub fn tls_listen(&self) -> String {
        let host = match self.listen.rsplit_once(':') {
            Some((host, _)) => host,
            None => self.listen.as_str(),
        };
        format!("{host}:{}", self.tls.port)
    }
}

impl MirrorConfig {
    /// Parse a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> MirrorResult<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> MirrorResult<()> {
        let url = self.upstream.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(MirrorError::Config(format!(
                "upstream.url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(MirrorError::Config(
                "upstream.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.cache.dir.as_os_str().is_empty() {
            return Err(MirrorError::Config("cache.dir must not be empty".into()));
        }
        let tls = &self.server.tls;
        if tls.enabled && (tls.cert_file.is_none() || tls.key_file.is_none()) {
            return Err(MirrorError::Config(
                "server.tls.enabled requires both cert_file and key_file".into(),
            ));
        }
        if tls.redirect_http && !tls.enabled {
            return Err(MirrorError::Config(
                "server.tls.redirect_http requires server.tls.enabled".into(),
            ));
        }
        if url.starts_with("http://") {
            tracing::warn!(
                upstream = %url,
                "upstream uses plaintext HTTP; artifacts are fetched unauthenticated"
            );
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            metrics_addr: Some("127.0.0.1:9100".into()),
            max_body_bytes: 1 << 20,
            shutdown_grace_secs: 10,
            log_level: "info".into(),
            log_format: "text".into(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            port: 443,
            redirect_http: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/zmirror"),
            sweep_scratch_on_start: true,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://ziglang.org".into(),
            timeout_secs: 30 * 60,
            idle_timeout_secs: 90,
        }
    }
}
