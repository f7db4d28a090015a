//! Edge-triggered probe logging.

use super::{ProbeResult, TargetKey};

use parking_lot::Mutex;
use std::collections::HashMap;

/// Kind of state change worth a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Started,
    Failed,
    ErrorChanged { previous: String },
    Recovered,
}

/// Last error message per target; an empty string means healthy.
#[derive(Default)]
pub struct TransitionLog {
    last: Mutex<HashMap<TargetKey, String>>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `result` and return the transition it caused, if any.
    pub fn observe(&self, result: &ProbeResult) -> Option<Transition> {
        let current = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();

        let mut last = self.last.lock();
        let previous = last.insert(result.key(), current.clone());

        match previous {
            None => Some(Transition::Started),
            Some(prev) if prev.is_empty() && !current.is_empty() => Some(Transition::Failed),
            Some(prev) if !prev.is_empty() && current.is_empty() => Some(Transition::Recovered),
            Some(prev) if !prev.is_empty() && prev != current => {
                Some(Transition::ErrorChanged { previous: prev })
            }
            Some(_) => None,
        }
    }

    /// Observe and emit the matching log line.
    pub fn log(&self, r: &ProbeResult) {
        let Some(transition) = self.observe(r) else {
            return;
        };

        let status = r.status.map(|s| s.as_str()).unwrap_or("");
        let err = r.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        match transition {
            Transition::Started => tracing::info!(
                group = %r.group, endpoint = %r.endpoint, route = %r.route, url = %r.url,
                protocol = %r.protocol, status, err = %err,
                "probe STARTED"
            ),
            Transition::Failed => tracing::warn!(
                group = %r.group, endpoint = %r.endpoint, route = %r.route, url = %r.url,
                protocol = %r.protocol, status, err = %err,
                "probe ERROR"
            ),
            Transition::ErrorChanged { previous } => tracing::warn!(
                group = %r.group, endpoint = %r.endpoint, route = %r.route, url = %r.url,
                protocol = %r.protocol, status, err = %err, was = %previous,
                "probe ERROR UPDATED"
            ),
            Transition::Recovered => tracing::info!(
                group = %r.group, endpoint = %r.endpoint, route = %r.route, url = %r.url,
                protocol = %r.protocol, status,
                "probe RECOVERED"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;

    fn result(error: Option<&str>) -> ProbeResult {
        ProbeResult {
            endpoint: "ep".into(),
            route: "r".into(),
            error: error.map(|e| ProbeError::Request(e.to_string())),
            ..ProbeResult::default()
        }
    }

    #[test]
    fn test_transitions_are_edge_triggered() {
        let log = TransitionLog::new();

        assert_eq!(log.observe(&result(None)), Some(Transition::Started));
        assert_eq!(log.observe(&result(None)), None);
        assert_eq!(log.observe(&result(Some("refused"))), Some(Transition::Failed));
        assert_eq!(log.observe(&result(Some("refused"))), None);
        assert!(matches!(
            log.observe(&result(Some("reset"))),
            Some(Transition::ErrorChanged { .. })
        ));
        assert_eq!(log.observe(&result(None)), Some(Transition::Recovered));
        assert_eq!(log.observe(&result(None)), None);
    }

    #[test]
    fn test_first_result_with_error_is_started() {
        let log = TransitionLog::new();
        assert_eq!(log.observe(&result(Some("refused"))), Some(Transition::Started));
        assert_eq!(log.observe(&result(Some("refused"))), None);
    }
}
