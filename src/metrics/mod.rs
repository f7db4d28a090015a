//! Metrics module: exported gauges kept in step with the latest results.
//!
//! Every target owns at most one validation/duration series and one set of
//! certificate series. Superseded label sets are deleted before new ones
//! are written so the registry never accumulates dead series.

mod status;

pub use status::*;

use crate::config::MetricsContext;
use crate::scheduler::{ProbeResult, ResultProvider, Subscriber, TargetKey};

use parking_lot::Mutex;
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const BASE_LABELS: &[&str] = &["group", "endpoint", "protocol", "url", "route"];
const RESULT_LABELS: &[&str] = &[
    "group", "endpoint", "protocol", "url", "route", "status", "is_error",
];
const CERT_LABELS: &[&str] = &[
    "group",
    "endpoint",
    "protocol",
    "url",
    "route",
    "cert_position",
    "cert_serial",
    "cert_cn",
    "cert_is_ca",
    "cert_issuer_cn",
];

/// Metrics error types.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Label values last written for each target.
#[derive(Default)]
struct Tracking {
    results: HashMap<TargetKey, Vec<String>>,
    certs: HashMap<TargetKey, Vec<Vec<String>>>,
}

/// Gauge set driven by probe results.
pub struct WdMetrics {
    provider: Arc<dyn ResultProvider>,

    last_probe: GaugeVec,
    validation: GaugeVec,
    duration: GaugeVec,
    cert_days_left: GaugeVec,

    tracking: Mutex<Tracking>,
}

impl WdMetrics {
    /// Create and register every gauge in `registry`; build info is set here
    /// and never touched again.
    pub fn new(
        registry: &Registry,
        context: &MetricsContext,
        provider: Arc<dyn ResultProvider>,
    ) -> Result<Self, MetricsError> {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(context.namespace.clone())
                .const_label("environment", context.environment.clone())
        };

        let build_info = Gauge::with_opts(
            Opts::new("build_info", "Program build information")
                .namespace(context.namespace.clone())
                .const_label("program_name", env!("CARGO_PKG_NAME"))
                .const_label("program_version", env!("CARGO_PKG_VERSION")),
        )?;
        let last_probe = GaugeVec::new(
            opts(
                "endpoint_last_probe_timestamp_seconds",
                "Unix timestamp of the last probe",
            ),
            BASE_LABELS,
        )?;
        let validation = GaugeVec::new(
            opts(
                "endpoint_validation",
                "Endpoint validation status (includes TLS error types)",
            ),
            RESULT_LABELS,
        )?;
        let duration = GaugeVec::new(
            opts(
                "endpoint_duration_seconds",
                "Duration of endpoint test in seconds",
            ),
            RESULT_LABELS,
        )?;
        let cert_days_left = GaugeVec::new(
            opts(
                "endpoint_tls_cert_days_left",
                "Days until certificate expiration (by chain position)",
            ),
            CERT_LABELS,
        )?;

        registry.register(Box::new(build_info.clone()))?;
        registry.register(Box::new(last_probe.clone()))?;
        registry.register(Box::new(validation.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(cert_days_left.clone()))?;

        build_info.set(1.0);

        Ok(Self {
            provider,
            last_probe,
            validation,
            duration,
            cert_days_left,
            tracking: Mutex::new(Tracking::default()),
        })
    }

    /// Apply one result to the exported gauges.
    pub fn on_result(&self, r: &ProbeResult) {
        let base = [
            r.group.as_str(),
            r.endpoint.as_str(),
            r.protocol.as_str(),
            r.url.as_str(),
            r.route.as_str(),
        ];
        self.last_probe
            .with_label_values(&base)
            .set(r.at.timestamp() as f64);

        let status = derive_status(r);
        let labels: Vec<String> = base
            .iter()
            .map(|s| s.to_string())
            .chain([status.as_str().to_string(), r.error.is_some().to_string()])
            .collect();
        let key = r.key();

        let mut tracking = self.tracking.lock();

        if let Some(previous) = tracking.results.get(&key) {
            if *previous != labels {
                let old = as_refs(previous);
                let _ = self.validation.remove_label_values(&old);
                let _ = self.duration.remove_label_values(&old);
            }
        }
        let current = as_refs(&labels);
        self.validation.with_label_values(&current).set(1.0);
        self.duration.with_label_values(&current).set(r.duration);
        tracking.results.insert(key.clone(), labels);

        if let Some(previous) = tracking.certs.remove(&key) {
            for cert in &previous {
                let _ = self.cert_days_left.remove_label_values(&as_refs(cert));
            }
        }

        let Some(report) = r.tls.as_ref().filter(|t| t.had_tls) else {
            return;
        };
        let mut written = Vec::with_capacity(report.certificates.len());
        for cert in &report.certificates {
            let labels: Vec<String> = base
                .iter()
                .map(|s| s.to_string())
                .chain([
                    cert.position.to_string(),
                    cert.serial_hex.clone(),
                    cert.common_name.clone(),
                    cert.is_ca.to_string(),
                    cert.issuer_cn.clone(),
                ])
                .collect();
            self.cert_days_left
                .with_label_values(&as_refs(&labels))
                .set(cert.days_left);
            written.push(labels);
        }
        tracking.certs.insert(key, written);
    }

    /// Drop every managed series and replay the provider's current snapshot.
    pub fn rebuild_all(&self) {
        let results = self.provider.snapshot();

        {
            let mut tracking = self.tracking.lock();
            self.last_probe.reset();
            self.validation.reset();
            self.duration.reset();
            self.cert_days_left.reset();
            *tracking = Tracking::default();
        }

        tracing::debug!("Rebuilding metrics from {} results", results.len());
        for r in &results {
            self.on_result(r);
        }
    }
}

impl Subscriber for WdMetrics {
    fn on_result(&self, result: &ProbeResult) {
        WdMetrics::on_result(self, result);
    }
}

fn as_refs(labels: &[String]) -> Vec<&str> {
    labels.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CertInfo, CertsReport, ProbeError, Status};
    use crate::scheduler::ResultStore;
    use chrono::{TimeZone, Utc};

    fn context() -> MetricsContext {
        MetricsContext {
            namespace: "wd".into(),
            environment: "test".into(),
        }
    }

    fn setup() -> (Registry, Arc<ResultStore>, WdMetrics) {
        let registry = Registry::new();
        let store = Arc::new(ResultStore::new());
        let metrics = WdMetrics::new(&registry, &context(), store.clone()).unwrap();
        (registry, store, metrics)
    }

    fn result(status: Status) -> ProbeResult {
        ProbeResult {
            group: "g".into(),
            endpoint: "ep".into(),
            protocol: "https".into(),
            url: "https://example.org/".into(),
            route: "direct".into(),
            status: Some(status),
            duration: 0.25,
            at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    fn cert(position: usize, cn: &str, days_left: f64) -> CertInfo {
        CertInfo {
            position,
            serial_hex: format!("{position:X}A"),
            common_name: cn.into(),
            issuer_cn: "Issuer".into(),
            not_after: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            days_left,
            is_ca: position > 0,
            subject_alt_names: Vec::new(),
        }
    }

    fn series(registry: &Registry, name: &str) -> usize {
        registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == name)
            .map(|f| f.get_metric().len())
            .sum()
    }

    const BASE: [&str; 5] = ["g", "ep", "https", "https://example.org/", "direct"];

    fn result_labels(status: &'static str, is_error: &'static str) -> Vec<&'static str> {
        BASE.iter().copied().chain([status, is_error]).collect()
    }

    #[test]
    fn test_build_info_set_once() {
        let (registry, _, _) = setup();
        let families = registry.gather();
        let build = families
            .iter()
            .find(|f| f.get_name() == "wd_build_info")
            .unwrap();
        let metric = &build.get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 1.0);
        assert!(metric.get_label().iter().any(|l| {
            l.get_name() == "program_version" && l.get_value() == env!("CARGO_PKG_VERSION")
        }));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let store: Arc<dyn ResultProvider> = Arc::new(ResultStore::new());
        assert!(WdMetrics::new(&registry, &context(), store.clone()).is_ok());
        assert!(matches!(
            WdMetrics::new(&registry, &context(), store),
            Err(MetricsError::Registration(_))
        ));
    }

    #[test]
    fn test_on_result_sets_timestamp_and_validation() {
        let (registry, _, metrics) = setup();
        let r = result(Status::Valid);
        metrics.on_result(&r);

        let ts = metrics.last_probe.get_metric_with_label_values(&BASE).unwrap();
        assert_eq!(ts.get(), r.at.timestamp() as f64);

        let v = metrics
            .validation
            .get_metric_with_label_values(&result_labels("valid", "false"))
            .unwrap();
        assert_eq!(v.get(), 1.0);
        let d = metrics
            .duration
            .get_metric_with_label_values(&result_labels("valid", "false"))
            .unwrap();
        assert_eq!(d.get(), 0.25);

        assert_eq!(series(&registry, "wd_endpoint_validation"), 1);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 0);
    }

    #[test]
    fn test_status_change_replaces_series() {
        let (registry, _, metrics) = setup();
        metrics.on_result(&result(Status::Valid));

        let mut failed = result(Status::RequestExecutionError);
        failed.error = Some(ProbeError::Request("connection refused".into()));
        metrics.on_result(&failed);

        assert_eq!(series(&registry, "wd_endpoint_validation"), 1);
        assert_eq!(series(&registry, "wd_endpoint_duration_seconds"), 1);
        let families = registry.gather();
        let validation = families
            .iter()
            .find(|f| f.get_name() == "wd_endpoint_validation")
            .unwrap();
        let labels = validation.get_metric()[0].get_label();
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "status" && l.get_value() == "request-execution-error"));
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "is_error" && l.get_value() == "true"));
        assert!(labels
            .iter()
            .any(|l| l.get_name() == "environment" && l.get_value() == "test"));
    }

    #[test]
    fn test_targets_are_tracked_independently() {
        let (registry, _, metrics) = setup();
        let a = result(Status::Valid);
        let mut b = result(Status::UnexpectedStatusCode);
        b.route = "proxy".into();

        metrics.on_result(&a);
        metrics.on_result(&b);
        metrics.on_result(&a);

        assert_eq!(series(&registry, "wd_endpoint_validation"), 2);
        assert_eq!(series(&registry, "wd_endpoint_last_probe_timestamp_seconds"), 2);
    }

    #[test]
    fn test_cert_series_replaced_and_cleared() {
        let (registry, _, metrics) = setup();

        let mut r = result(Status::Valid);
        r.tls = Some(CertsReport {
            had_tls: true,
            chain_valid: true,
            certificates: vec![cert(0, "example.org", 42.5), cert(1, "Issuer", 900.0)],
        });
        metrics.on_result(&r);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 2);

        let leaf: Vec<&str> = BASE
            .iter()
            .copied()
            .chain(["0", "0A", "example.org", "false", "Issuer"])
            .collect();
        let g = metrics
            .cert_days_left
            .get_metric_with_label_values(&leaf)
            .unwrap();
        assert_eq!(g.get(), 42.5);

        // Renewed leaf: the old serial must disappear.
        if let Some(tls) = r.tls.as_mut() {
            tls.certificates.truncate(1);
            tls.certificates[0].serial_hex = "FF".into();
        }
        metrics.on_result(&r);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 1);

        r.tls = None;
        metrics.on_result(&r);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 0);
    }

    #[test]
    fn test_chain_invalid_exports_chain_status() {
        let (_, _, metrics) = setup();
        let mut r = result(Status::Valid);
        r.tls = Some(CertsReport {
            had_tls: true,
            chain_valid: false,
            certificates: vec![cert(0, "example.org", 10.0)],
        });
        metrics.on_result(&r);

        let v = metrics
            .validation
            .get_metric_with_label_values(&result_labels("invalid-tls-chain", "false"))
            .unwrap();
        assert_eq!(v.get(), 1.0);
    }

    #[test]
    fn test_missing_tls_clears_certs() {
        let (registry, _, metrics) = setup();
        let mut r = result(Status::Valid);
        r.tls = Some(CertsReport {
            had_tls: true,
            chain_valid: true,
            certificates: vec![cert(0, "example.org", 10.0)],
        });
        metrics.on_result(&r);

        r.tls = Some(CertsReport::default());
        metrics.on_result(&r);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 0);
        assert_eq!(
            metrics
                .validation
                .get_metric_with_label_values(&result_labels("invalid-tls-missing", "false"))
                .unwrap()
                .get(),
            1.0
        );
    }

    #[test]
    fn test_rebuild_all_replays_snapshot() {
        let (registry, store, metrics) = setup();

        let mut stale = result(Status::Valid);
        stale.endpoint = "gone".into();
        metrics.on_result(&stale);

        let mut r = result(Status::Valid);
        r.tls = Some(CertsReport {
            had_tls: true,
            chain_valid: true,
            certificates: vec![cert(0, "example.org", 10.0)],
        });
        store.put(r.clone());
        metrics.on_result(&r);

        metrics.rebuild_all();
        let first = registry.gather();
        assert_eq!(series(&registry, "wd_endpoint_validation"), 1);
        assert_eq!(series(&registry, "wd_endpoint_tls_cert_days_left"), 1);
        assert_eq!(series(&registry, "wd_build_info"), 1);

        metrics.rebuild_all();
        assert_eq!(first, registry.gather());
    }
}
