//! Final status label for a probe result.

use crate::probe::Status;
use crate::scheduler::ProbeResult;

/// Substrings of an error message that name a TLS outcome, checked in order.
const TLS_LABEL_HINTS: &[(&str, Status)] = &[
    ("expired-cert-leaf", Status::ExpiredCertLeaf),
    ("invalid-tls-chain", Status::InvalidTlsChain),
    ("invalid-tls-hostname", Status::InvalidTlsHostname),
    ("invalid-tls-certificate", Status::InvalidTlsCertificate),
    ("invalid-tls-unknown-authority", Status::InvalidTlsUnknownAuthority),
    ("invalid-tls-handshake", Status::InvalidTlsHandshake),
    ("invalid-tls-other", Status::InvalidTlsOther),
];

/// Find the first TLS label mentioned in an error message.
pub fn classify_label_text(message: &str) -> Option<Status> {
    let message = message.to_ascii_lowercase();
    TLS_LABEL_HINTS
        .iter()
        .find(|(hint, _)| message.contains(hint))
        .map(|(_, status)| *status)
}

/// Pick the exported status: TLS report facts, then TLS labels found in the
/// error, then the validator's own status, then the error catch-all.
pub fn derive_status(r: &ProbeResult) -> Status {
    if let Some(tls) = &r.tls {
        if !tls.had_tls {
            return Status::InvalidTlsMissing;
        }
        if !tls.chain_valid {
            return Status::InvalidTlsChain;
        }
    }

    if let Some(err) = &r.error {
        if let Some(status) = classify_label_text(&err.to_string()) {
            return status;
        }
    }

    match (r.status, &r.error) {
        (Some(status), _) => status,
        (None, Some(_)) => Status::UnknownError,
        (None, None) => Status::Valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CertsReport, ProbeError};

    fn report(had_tls: bool, chain_valid: bool) -> Option<CertsReport> {
        Some(CertsReport {
            had_tls,
            chain_valid,
            certificates: Vec::new(),
        })
    }

    #[test]
    fn test_tls_report_outranks_everything() {
        let r = ProbeResult {
            tls: report(false, false),
            status: Some(Status::UnexpectedStatusCode),
            error: Some(ProbeError::Request("expired-cert-leaf".into())),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::InvalidTlsMissing);

        let r = ProbeResult {
            tls: report(true, false),
            status: Some(Status::Valid),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::InvalidTlsChain);
    }

    #[test]
    fn test_error_label_outranks_explicit_status() {
        let r = ProbeResult {
            status: Some(Status::RequestExecutionError),
            error: Some(ProbeError::Tls {
                status: Status::InvalidTlsHostname,
                detail: "certificate not valid for name".into(),
            }),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::InvalidTlsHostname);
    }

    #[test]
    fn test_explicit_status_then_fallbacks() {
        let r = ProbeResult {
            status: Some(Status::RequestExecutionTimeout),
            error: Some(ProbeError::Request("deadline".into())),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::RequestExecutionTimeout);

        let r = ProbeResult {
            error: Some(ProbeError::Request("boom".into())),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::UnknownError);

        assert_eq!(derive_status(&ProbeResult::default()), Status::Valid);
    }

    #[test]
    fn test_valid_tls_report_keeps_status() {
        let r = ProbeResult {
            tls: report(true, true),
            status: Some(Status::UnexpectedBodyRegex),
            ..Default::default()
        };
        assert_eq!(derive_status(&r), Status::UnexpectedBodyRegex);
    }

    #[test]
    fn test_classify_label_text_order() {
        assert_eq!(
            classify_label_text("Invalid-TLS-Chain and invalid-tls-hostname"),
            Some(Status::InvalidTlsChain)
        );
        assert_eq!(
            classify_label_text("x: invalid-tls-unknown-authority: y"),
            Some(Status::InvalidTlsUnknownAuthority)
        );
        assert_eq!(classify_label_text("connection refused"), None);
    }
}
