//! Upstream HTTP client factory.

use reqwest::Client;
use zmirror_core::config::UpstreamConfig;

/// Build the process-wide upstream client.
///
/// `timeout` bounds a whole download, connect through the last body byte,
/// so a stalled origin cannot pin a download slot forever.
pub fn build_client(cfg: &UpstreamConfig) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("zmirror/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.timeout())
        .pool_idle_timeout(cfg.idle_timeout())
        .build()
}
