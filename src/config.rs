//! Configuration module for the watchdog exporter.
//!
//! Loads the YAML configuration file, fills defaults and applies a couple of
//! process-level overrides from environment variables.

use regex::bytes::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::env;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LISTEN_ADDRESS: &str = ":9321";
const DEFAULT_TELEMETRY_PATH: &str = "/metrics";
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_BODY_LIMIT: usize = 1024;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchdogConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub metrics: MetricsContext,
    #[serde(default)]
    pub routes: BTreeMap<String, Route>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// Process-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default)]
    pub listen_address: String,
    #[serde(default)]
    pub telemetry_path: String,
    /// Accepted for compatibility; the engine runs one task per endpoint
    /// and does not cap in-flight probes.
    #[serde(default)]
    pub max_workers_count: usize,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub default_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub probe_interval: Option<Duration>,
    #[serde(default)]
    pub response_body_limit: usize,
    #[serde(default)]
    pub debug: bool,
}

/// Metric naming context.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsContext {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub environment: String,
}

/// A network path a request can take.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Route {
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub target_ip: Option<IpAddr>,
}

/// A probed endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub routes: Vec<String>,
    pub request: EndpointRequest,
    #[serde(default)]
    pub validation: Option<EndpointValidation>,
    #[serde(default)]
    pub inspect_tls_certs: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointRequest {
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub url: String,
}

impl EndpointRequest {
    /// Request timeout.
    ///
    /// Loading fills an unset timeout from `settings.default-timeout`, so the
    /// built-in default only applies to requests that never went through
    /// [`WatchdogConfig::from_yaml`].
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Declarative response validation rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointValidation {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "de_opt_regex")]
    pub body_regex: Option<Regex>,
}

impl WatchdogConfig {
    /// Load, default-fill and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml(&data)?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a YAML document, then fill defaults and validate.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut cfg: WatchdogConfig = serde_yaml::from_str(data)?;
        cfg.fill_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables:
    /// - `WATCHDOG_LISTEN_ADDRESS`: overrides `settings.listen-address`
    /// - `WATCHDOG_TELEMETRY_PATH`: overrides `settings.telemetry-path`
    fn apply_env(&mut self) {
        if let Ok(addr) = env::var("WATCHDOG_LISTEN_ADDRESS") {
            if !addr.is_empty() {
                self.settings.listen_address = addr;
            }
        }

        if let Ok(path) = env::var("WATCHDOG_TELEMETRY_PATH") {
            if path.starts_with('/') {
                self.settings.telemetry_path = path;
            }
        }
    }

    fn fill_defaults(&mut self) {
        let s = &mut self.settings;
        if s.listen_address.is_empty() {
            s.listen_address = DEFAULT_LISTEN_ADDRESS.to_string();
        }
        if s.telemetry_path.is_empty() {
            s.telemetry_path = DEFAULT_TELEMETRY_PATH.to_string();
        }
        if s.max_workers_count == 0 {
            s.max_workers_count = DEFAULT_MAX_WORKERS;
        }
        if s.default_timeout.map_or(true, |t| t.is_zero()) {
            s.default_timeout = Some(DEFAULT_TIMEOUT);
        }
        if s.probe_interval.map_or(true, |t| t.is_zero()) {
            s.probe_interval = Some(DEFAULT_PROBE_INTERVAL);
        }
        if s.response_body_limit == 0 {
            s.response_body_limit = DEFAULT_BODY_LIMIT;
        }

        let default_timeout = s.default_timeout;
        for endpoint in self.endpoints.values_mut() {
            if endpoint.request.timeout.map_or(true, |t| t.is_zero()) {
                endpoint.request.timeout = default_timeout;
            }
            if endpoint.request.method.is_empty() {
                endpoint.request.method = "GET".to_string();
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.settings.telemetry_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "telemetry-path {:?} must start with '/'",
                self.settings.telemetry_path
            )));
        }
        for (name, endpoint) in &self.endpoints {
            if endpoint.request.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {name:?} has no request url"
                )));
            }
            for route in &endpoint.routes {
                if !self.routes.contains_key(route) {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint {name:?} references unknown route {route:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Probe interval shared by every endpoint loop.
    pub fn probe_interval(&self) -> Duration {
        self.settings.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL)
    }

    /// Socket address for the metrics listener; `":port"` binds all interfaces.
    pub fn listen_address(&self) -> String {
        let addr = &self.settings.listen_address;
        if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.clone()
        }
    }

    /// Log a one-time summary of what is about to be probed.
    pub fn log_summary(&self) {
        let targets: usize = self.endpoints.values().map(|e| e.routes.len()).sum();
        tracing::info!(
            endpoints = self.endpoints.len(),
            routes = self.routes.len(),
            targets,
            interval = ?self.probe_interval(),
            default_timeout = ?self.settings.default_timeout,
            body_limit = self.settings.response_body_limit,
            "Loaded configuration"
        );
        tracing::info!(
            "max-workers-count={} is advisory; each endpoint runs its own probe loop",
            self.settings.max_workers_count
        );
        for (name, endpoint) in &self.endpoints {
            if endpoint.routes.is_empty() {
                tracing::warn!("Endpoint {} has no routes and will never be probed", name);
            }
        }
    }
}

fn de_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) if !s.trim().is_empty() => humantime::parse_duration(s.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn de_opt_regex<'de, D>(deserializer: D) -> Result<Option<Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) if !s.is_empty() => Regex::new(&s).map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
