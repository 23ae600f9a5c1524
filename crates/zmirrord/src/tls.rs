//! HTTPS listener configuration and the plain-HTTP redirect.

use anyhow::{bail, Context, Result};
use axum::{
    extract::{ConnectInfo, Request},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::server::remote_ip;

/// Load a PEM certificate chain and private key into a TLS 1.3 server config.
pub fn load_rustls_config(cert_file: &Path, key_file: &Path) -> Result<RustlsConfig> {
    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("reading certificate {}", cert_file.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_file.display());
    }
    let key = PrivateKeyDer::from_pem_file(key_file)
        .with_context(|| format!("reading private key {}", key_file.display()))?;

    let provider = Arc::new(ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("configuring TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("loading TLS key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// Every request gets a 301 to the same URI on the HTTPS port.
pub fn redirect_router(tls_port: u16) -> Router {
    Router::new().fallback(move |req: Request| async move { redirect(&req, tls_port) })
}

fn redirect(req: &Request, tls_port: u16) -> Response {
    let Some(host) = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };
    let request_uri = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let target = https_target(host, tls_port, request_uri);

    let Ok(location) = HeaderValue::from_str(&target) else {
        return (StatusCode::BAD_REQUEST, "invalid Host header").into_response();
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    info!(
        remote_ip = %remote_ip(req.headers(), peer),
        method = %req.method(),
        host,
        path = %req.uri().path(),
        target = %target,
        "redirecting http to https"
    );

    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

/// `https://{host without port}:{port}{request_uri}`
pub fn https_target(host: &str, port: u16, request_uri: &str) -> String {
    format!("https://{}:{port}{request_uri}", strip_port(host))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
