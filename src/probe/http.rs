//! HTTP response validation.

use super::{error_chain, is_timeout, ProbeError, Status};
use crate::config::EndpointValidation;

use async_trait::async_trait;
use reqwest::Response;

/// Judges a completed response against a validation rule.
///
/// Implementations read at most `body_limit` bytes and leave closing the
/// response to the caller.
#[async_trait]
pub trait ResponseChecker: Send + Sync {
    async fn validate_response(
        &self,
        url: &str,
        route: &str,
        resp: &mut Response,
        body_limit: usize,
        rule: &EndpointValidation,
    ) -> (Status, Option<ProbeError>);
}

/// Status code, then headers, then (optionally) a bounded body regex.
#[derive(Debug, Default)]
pub struct DefaultResponseChecker;

#[async_trait]
impl ResponseChecker for DefaultResponseChecker {
    async fn validate_response(
        &self,
        url: &str,
        route: &str,
        resp: &mut Response,
        body_limit: usize,
        rule: &EndpointValidation,
    ) -> (Status, Option<ProbeError>) {
        let got = resp.status().as_u16();
        if got != rule.status_code {
            tracing::debug!(
                "{}: {} / '{}', expected '{}', got '{}'",
                Status::UnexpectedStatusCode,
                url,
                route,
                rule.status_code,
                got
            );
            return (Status::UnexpectedStatusCode, None);
        }

        for (name, expected) in &rule.headers {
            let got = resp
                .headers()
                .get(name.as_str())
                .map(|v| v.to_str().unwrap_or_default())
                .unwrap_or_default();
            if got != expected {
                tracing::debug!(
                    "{}: {} / '{}', header {}, expected '{}', got '{}'",
                    Status::UnexpectedHeaderValue,
                    url,
                    route,
                    name,
                    expected,
                    got
                );
                return (Status::UnexpectedHeaderValue, None);
            }
        }

        let Some(pattern) = &rule.body_regex else {
            return (Status::Valid, None);
        };

        let body = match read_limited(resp, body_limit).await {
            Ok(body) => body,
            Err(e) => {
                let detail = error_chain(&e);
                let status = if is_timeout(&e) {
                    Status::RequestExecutionTimeout
                } else {
                    Status::RequestExecutionError
                };
                tracing::debug!(
                    "{}: {} / '{}', body read error: {}",
                    status,
                    url,
                    route,
                    detail
                );
                return (status, Some(ProbeError::Body(detail)));
            }
        };

        if !pattern.is_match(&body) {
            tracing::debug!(
                "{}: {} / '{}', expected regex '{}', got ---\n{}\n---",
                Status::UnexpectedBodyRegex,
                url,
                route,
                pattern.as_str(),
                String::from_utf8_lossy(&body)
            );
            return (Status::UnexpectedBodyRegex, None);
        }

        (Status::Valid, None)
    }
}

/// Read the body up to `limit` bytes; anything past the limit is discarded
/// unread or truncated.
async fn read_limited(resp: &mut Response, limit: usize) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::with_capacity(limit.min(64 * 1024));
    while body.len() < limit {
        match resp.chunk().await? {
            Some(chunk) => {
                let room = limit - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            None => break,
        }
    }
    Ok(body)
}
