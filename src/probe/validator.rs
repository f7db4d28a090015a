//! Orchestration of a single probe: transport, request, TLS and response
//! checks folded into one outcome.

use super::{
    build_client, error_chain, is_timeout, parse_proxy, CertsReport, DefaultResponseChecker,
    DefaultTlsInspector, ProbeError, ResponseChecker, Status, TlsInspector, TransportError,
    TransportSpec,
};
use crate::config::{EndpointRequest, EndpointValidation, Route};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL};
use reqwest::{Method, Url};
use std::sync::Arc;
use std::time::Instant;

/// Header carrying the local time at which the probe was sent.
pub const LOCAL_TIME_HEADER: &str = "x-local-time";

/// Everything one probe produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    /// Seconds.
    pub duration: f64,
    pub tls: Option<CertsReport>,
    pub error: Option<ProbeError>,
}

impl Outcome {
    fn failed(status: Status, duration: f64, error: ProbeError) -> Self {
        Self {
            status,
            duration,
            tls: None,
            error: Some(error),
        }
    }
}

/// Runs probes with pluggable TLS and response checks.
#[derive(Clone)]
pub struct ProbeValidator {
    tls: Arc<dyn TlsInspector>,
    checker: Arc<dyn ResponseChecker>,
    body_limit: usize,
}

impl ProbeValidator {
    pub fn new(
        tls: Arc<dyn TlsInspector>,
        checker: Arc<dyn ResponseChecker>,
        body_limit: usize,
    ) -> Self {
        Self {
            tls,
            checker,
            body_limit,
        }
    }

    /// Validator with the production TLS inspector and response checker.
    pub fn with_defaults(body_limit: usize) -> Self {
        Self::new(
            Arc::new(DefaultTlsInspector::new()),
            Arc::new(DefaultResponseChecker),
            body_limit,
        )
    }

    /// Probe `request` over `route`. A `None` rule checks reachability only.
    pub async fn validate(
        &self,
        endpoint: &str,
        request: &EndpointRequest,
        route_name: &str,
        route: &Route,
        rule: Option<&EndpointValidation>,
        inspect_tls: bool,
    ) -> Outcome {
        let url = match Url::parse(&request.url) {
            Ok(url) if url.host_str().is_some() => url,
            Ok(_) => {
                return self.config_failure(
                    Status::InvalidUrl,
                    format!("url {:?} has no host", request.url),
                )
            }
            Err(e) => {
                return self.config_failure(
                    Status::InvalidUrl,
                    format!("cannot parse url {:?}: {e}", request.url),
                )
            }
        };

        if let Err(e) = parse_proxy(route) {
            return self.config_failure(Status::InvalidProxyDefinition, e.to_string());
        }

        let (method, headers) = match build_request_parts(request) {
            Ok(parts) => parts,
            Err(reason) => {
                return self.config_failure(
                    Status::InvalidRequestDefinition,
                    format!("endpoint {endpoint}: {reason}"),
                )
            }
        };

        let (tls_config, capture) = match self.tls.client_config() {
            Ok(parts) => parts,
            Err(e) => return Outcome::failed(Status::InvalidRequestExecution, 0.0, e),
        };

        let timeout = request.timeout();
        let client = match build_client(TransportSpec {
            timeout,
            url: &url,
            route,
            tls: tls_config,
        }) {
            Ok(client) => client,
            Err(e @ TransportError::InvalidProxy { .. }) => {
                return self.config_failure(Status::InvalidProxyDefinition, e.to_string())
            }
            Err(e) => {
                return Outcome::failed(
                    Status::InvalidRequestExecution,
                    0.0,
                    ProbeError::Config(e.to_string()),
                )
            }
        };

        let is_https = url.scheme() == "https";
        let start = Instant::now();
        let sent = client.request(method, url).headers(headers).send().await;

        let mut resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                let duration = start.elapsed().as_secs_f64();
                let outcome = self.transport_failure(is_https, e, timeout, duration);
                tracing::debug!(
                    "{}: {} / '{}': {:?}",
                    outcome.status,
                    request.url,
                    route_name,
                    outcome.error
                );
                return outcome;
            }
        };

        let tls = (inspect_tls && is_https).then(|| self.tls.inspect(&capture));
        if let Some(leaf) = tls.as_ref().and_then(|t| t.certificates.first()) {
            tracing::debug!(
                "{} / '{}': leaf {} expires {} (SANs: {})",
                request.url,
                route_name,
                leaf.common_name,
                leaf.not_after.to_rfc3339(),
                leaf.subject_alt_names.join(", ")
            );
        }

        let (status, error) = match rule {
            Some(rule) => {
                self.checker
                    .validate_response(&request.url, route_name, &mut resp, self.body_limit, rule)
                    .await
            }
            None => (Status::Valid, None),
        };
        drop(resp);

        Outcome {
            status,
            duration: start.elapsed().as_secs_f64(),
            tls,
            error,
        }
    }

    fn config_failure(&self, status: Status, reason: String) -> Outcome {
        tracing::warn!("{}: {}", status, reason);
        Outcome::failed(status, 0.0, ProbeError::Config(reason))
    }

    fn transport_failure(
        &self,
        is_https: bool,
        err: reqwest::Error,
        timeout: std::time::Duration,
        duration: f64,
    ) -> Outcome {
        // The URL never reaches classification or messages.
        let err = err.without_url();
        let tls_status = if is_https {
            self.tls.classify_handshake_error(&err)
        } else {
            None
        };
        let timed_out = is_timeout(&err);
        let detail = error_chain(&err);

        if let Some(status) = tls_status {
            return Outcome::failed(status, duration, ProbeError::Tls { status, detail });
        }
        if timed_out {
            Outcome::failed(
                Status::RequestExecutionTimeout,
                duration,
                ProbeError::Timeout(timeout, detail),
            )
        } else {
            Outcome::failed(
                Status::InvalidRequestExecution,
                duration,
                ProbeError::Request(detail),
            )
        }
    }
}

/// Method and headers for the outgoing request. User headers win over the
/// defaults added here.
fn build_request_parts(request: &EndpointRequest) -> Result<(Method, HeaderMap), String> {
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
        .map_err(|e| format!("invalid method {:?}: {e}", request.method))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name {name:?}: {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid value for header {name}: {e}"))?;
        headers.insert(name, value);
    }

    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    if !headers.contains_key(LOCAL_TIME_HEADER) {
        let now = chrono::Local::now().to_rfc3339();
        if let Ok(value) = HeaderValue::from_str(&now) {
            headers.insert(LOCAL_TIME_HEADER, value);
        }
    }

    Ok((method, headers))
}
