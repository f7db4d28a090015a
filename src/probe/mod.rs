//! Probe module for endpoint validation.
//!
//! One probe is one HTTP(S) request over one route, judged against an
//! optional validation rule and optionally inspected at the TLS layer.

mod http;
mod tls;
mod transport;
mod validator;

pub use http::*;
pub use tls::*;
pub use transport::*;
pub use validator::*;

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Outcome label of a probe, exported as the `status` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Valid,
    UnexpectedStatusCode,
    UnexpectedHeaderValue,
    UnexpectedBodyRegex,
    RequestExecutionTimeout,
    RequestExecutionError,
    InvalidRequestExecution,
    InvalidUrl,
    InvalidProxyDefinition,
    InvalidRequestDefinition,
    ExpiredCertLeaf,
    InvalidTlsChain,
    InvalidTlsHostname,
    InvalidTlsCertificate,
    InvalidTlsUnknownAuthority,
    InvalidTlsHandshake,
    InvalidTlsOther,
    InvalidTlsMissing,
    UnknownError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Valid => "valid",
            Status::UnexpectedStatusCode => "unexpected-status-code",
            Status::UnexpectedHeaderValue => "unexpected-header-value",
            Status::UnexpectedBodyRegex => "unexpected-body-regex",
            Status::RequestExecutionTimeout => "request-execution-timeout",
            Status::RequestExecutionError => "request-execution-error",
            Status::InvalidRequestExecution => "invalid-request-execution",
            Status::InvalidUrl => "invalid-url",
            Status::InvalidProxyDefinition => "invalid-proxy-definition",
            Status::InvalidRequestDefinition => "invalid-request-definition",
            Status::ExpiredCertLeaf => "expired-cert-leaf",
            Status::InvalidTlsChain => "invalid-tls-chain",
            Status::InvalidTlsHostname => "invalid-tls-hostname",
            Status::InvalidTlsCertificate => "invalid-tls-certificate",
            Status::InvalidTlsUnknownAuthority => "invalid-tls-unknown-authority",
            Status::InvalidTlsHandshake => "invalid-tls-handshake",
            Status::InvalidTlsOther => "invalid-tls-other",
            Status::InvalidTlsMissing => "invalid-tls-missing",
            Status::UnknownError => "unknown-error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe error types.
///
/// Errors are stored in results and copied into snapshots, so variants
/// carry rendered messages rather than the source errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out after {0:?}: {1}")]
    Timeout(Duration, String),
    /// The message leads with the classified label.
    #[error("{status}: {detail}")]
    Tls { status: Status, detail: String },
    #[error("response body read failed: {0}")]
    Body(String),
}

/// Render an error and all of its sources as one line.
///
/// `io::Error` hides a custom payload from `source()`, so its inner error
/// is visited explicitly.
pub(crate) fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = Vec::new();
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = match e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
            Some(inner) => inner.source(),
            None => e.source(),
        };
    }
    parts.join(": ")
}

/// Whether an error (or any of its sources) is a deadline expiry.
pub(crate) fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(re) = e.downcast_ref::<reqwest::Error>() {
            if re.is_timeout() {
                return true;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        current = e.source();
    }
    false
}
