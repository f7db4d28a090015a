//! Per-probe HTTP client construction.

use crate::config::Route;

use reqwest::{redirect, Client, Proxy, Url};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// TCP keep-alive applied to the probe socket.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },
    #[error("cannot build http client: {0}")]
    Build(String),
}

/// Inputs for one probe's client.
pub struct TransportSpec<'a> {
    pub timeout: Duration,
    pub url: &'a Url,
    pub route: &'a Route,
    pub tls: rustls::ClientConfig,
}

/// Parse a route's proxy url, if any.
pub fn parse_proxy(route: &Route) -> Result<Option<Url>, TransportError> {
    let Some(raw) = route.proxy_url.as_deref().filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidProxy {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(TransportError::InvalidProxy {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(Some(url))
}

/// Build a fresh client for a single probe.
///
/// A target-ip override only changes where the socket connects; the URL,
/// and therefore the `Host` header and TLS SNI, keep the original hostname.
/// Redirects are not followed and connections are never pooled.
pub fn build_client(spec: TransportSpec<'_>) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .timeout(spec.timeout)
        .connect_timeout(spec.timeout)
        .tcp_keepalive(KEEP_ALIVE)
        .pool_max_idle_per_host(0)
        .redirect(redirect::Policy::none())
        .use_preconfigured_tls(spec.tls);

    match parse_proxy(spec.route)? {
        Some(proxy_url) => {
            let raw = proxy_url.to_string();
            let proxy = Proxy::all(proxy_url).map_err(|e| TransportError::InvalidProxy {
                url: raw,
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        None => builder = builder.no_proxy(),
    }

    if let (Some(ip), Some(host)) = (spec.route.target_ip, spec.url.host_str()) {
        // The port here is ignored; reqwest keeps the one from the URL.
        let port = spec.url.port_or_known_default().unwrap_or(0);
        builder = builder.resolve(host, SocketAddr::new(ip, port));
    }

    builder.build().map_err(|e| TransportError::Build(e.to_string()))
}
