//! Scheduler module: per-endpoint probe loops and result fan-out.

mod store;
mod transitions;

pub use store::*;
pub use transitions::*;

use crate::config::{Endpoint, WatchdogConfig};
use crate::probe::{CertsReport, ProbeError, ProbeValidator, Status};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval used when the configured one is zero.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(30);

/// Natural key of a probed target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub group: String,
    pub endpoint: String,
    pub route: String,
    pub protocol: String,
    pub url: String,
}

/// One probe outcome for an endpoint and route.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub group: String,
    pub endpoint: String,
    pub protocol: String,
    pub url: String,
    pub route: String,

    pub status: Option<Status>,
    /// Seconds.
    pub duration: f64,
    pub error: Option<ProbeError>,
    pub tls: Option<CertsReport>,

    /// When the probe finished.
    pub at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            group: self.group.clone(),
            endpoint: self.endpoint.clone(),
            route: self.route.clone(),
            protocol: self.protocol.clone(),
            url: self.url.clone(),
        }
    }
}

/// Snapshot access for pull-style readers.
pub trait ResultProvider: Send + Sync {
    fn snapshot(&self) -> Vec<ProbeResult>;
}

/// Push-style consumer notified once per completed probe.
///
/// Called on the probing task; implementations must be fast or buffer
/// internally.
pub trait Subscriber: Send + Sync {
    fn on_result(&self, result: &ProbeResult);
}

/// Runs one probe loop per endpoint and fans results out.
pub struct Engine {
    config: Arc<WatchdogConfig>,
    validator: ProbeValidator,
    store: Arc<ResultStore>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    transitions: TransitionLog,
}

impl Engine {
    pub fn new(config: Arc<WatchdogConfig>, validator: ProbeValidator) -> Self {
        Self {
            config,
            validator,
            store: Arc::new(ResultStore::new()),
            subscribers: RwLock::new(Vec::new()),
            transitions: TransitionLog::new(),
        }
    }

    pub fn provider(&self) -> Arc<dyn ResultProvider> {
        self.store.clone()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Run every endpoint loop until `cancel` fires, then wait for all of
    /// them to return.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = match self.config.probe_interval() {
            d if d.is_zero() => FALLBACK_INTERVAL,
            d => d,
        };

        tracing::info!(
            "Starting engine with {} endpoints every {:?}",
            self.config.endpoints.len(),
            interval
        );

        let mut loops = JoinSet::new();
        for name in self.config.endpoints.keys() {
            let engine = self.clone();
            let name = name.clone();
            let cancel = cancel.clone();
            loops.spawn(async move { engine.run_endpoint_loop(&name, interval, cancel).await });
        }

        cancel.cancelled().await;
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Endpoint loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Engine stopped");
    }

    async fn run_endpoint_loop(&self, name: &str, interval: Duration, cancel: CancellationToken) {
        let Some(endpoint) = self.config.endpoints.get(name) else {
            return;
        };

        let jitter = initial_jitter(interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + jitter, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("Endpoint {} first probe in {:?}", name, jitter);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Not raced against cancellation: an in-flight probe
                    // finishes under its own request timeout.
                    self.probe_once(name, endpoint).await;
                }
            }
        }
    }

    /// Probe every route of `endpoint` in order.
    async fn probe_once(&self, name: &str, endpoint: &Endpoint) {
        for route_name in &endpoint.routes {
            let route = self
                .config
                .routes
                .get(route_name)
                .cloned()
                .unwrap_or_default();

            let outcome = self
                .validator
                .validate(
                    name,
                    &endpoint.request,
                    route_name,
                    &route,
                    endpoint.validation.as_ref(),
                    endpoint.inspect_tls_certs,
                )
                .await;

            let result = ProbeResult {
                group: endpoint.group.clone(),
                endpoint: name.to_string(),
                protocol: endpoint.protocol.clone(),
                url: endpoint.request.url.clone(),
                route: route_name.clone(),
                status: Some(outcome.status),
                duration: outcome.duration,
                error: outcome.error,
                tls: outcome.tls,
                at: Utc::now(),
            };

            self.publish(result);
        }
    }

    fn publish(&self, result: ProbeResult) {
        self.transitions.log(&result);
        self.store.put(result.clone());
        self.notify(&result);
    }

    fn notify(&self, result: &ProbeResult) {
        let subscribers = self.subscribers.read().clone();
        for sub in subscribers {
            if catch_unwind(AssertUnwindSafe(|| sub.on_result(result))).is_err() {
                tracing::warn!(
                    endpoint = %result.endpoint, route = %result.route,
                    "Subscriber panicked while handling a result"
                );
            }
        }
    }
}

/// Random delay in `[0, interval / 10)` before an endpoint's first probe.
fn initial_jitter(interval: Duration) -> Duration {
    let bound = interval / 10;
    if bound.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..bound)
}
