//! TLS inspection: handshake error classification and chain reports.

use super::{error_chain, ProbeError, Status};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::error::Error as StdError;
use std::sync::Arc;
use x509_parser::prelude::*;

/// Basic facts about one certificate of a presented chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    /// 0 = leaf, then upward toward the root.
    pub position: usize,
    /// Uppercase hex, no prefix.
    pub serial_hex: String,
    pub common_name: String,
    pub issuer_cn: String,
    pub not_after: DateTime<Utc>,
    /// Negative once the certificate has expired.
    pub days_left: f64,
    pub is_ca: bool,
    pub subject_alt_names: Vec<String>,
}

/// Summary of the TLS layer of one probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CertsReport {
    pub had_tls: bool,
    /// True only if the chain verified against the trust roots and hostname.
    pub chain_valid: bool,
    /// Ordered leaf first.
    pub certificates: Vec<CertInfo>,
}

/// What the verifier saw during one handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerChain {
    pub certificates: Vec<CertificateDer<'static>>,
    pub verified: bool,
}

/// Shared slot the recording verifier writes the peer chain into.
#[derive(Debug, Clone, Default)]
pub struct HandshakeCapture(Arc<Mutex<Option<PeerChain>>>);

impl HandshakeCapture {
    pub fn get(&self) -> Option<PeerChain> {
        self.0.lock().clone()
    }

    fn record(&self, chain: PeerChain) {
        *self.0.lock() = Some(chain);
    }
}

/// TLS-related validation and inspection.
pub trait TlsInspector: Send + Sync {
    /// Client config for a single probe together with the capture its
    /// verifier fills in.
    fn client_config(&self) -> Result<(ClientConfig, HandshakeCapture), ProbeError>;

    /// Map a transport error to a TLS status, or `None` if it is not a TLS
    /// failure.
    fn classify_handshake_error(&self, err: &(dyn StdError + 'static)) -> Option<Status>;

    /// Build the chain report from a completed handshake.
    fn inspect(&self, capture: &HandshakeCapture) -> CertsReport;
}

/// Production inspector backed by the WebPKI verifier.
pub struct DefaultTlsInspector {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl DefaultTlsInspector {
    /// Inspector trusting the Mozilla root store.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl Default for DefaultTlsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsInspector for DefaultTlsInspector {
    fn client_config(&self) -> Result<(ClientConfig, HandshakeCapture), ProbeError> {
        let inner =
            WebPkiServerVerifier::builder_with_provider(self.roots.clone(), self.provider.clone())
                .build()
                .map_err(|e| ProbeError::Config(format!("tls verifier: {e}")))?;

        let capture = HandshakeCapture::default();
        let verifier = RecordingVerifier {
            inner,
            capture: capture.clone(),
        };

        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProbeError::Config(format!("tls protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok((config, capture))
    }

    fn classify_handshake_error(&self, err: &(dyn StdError + 'static)) -> Option<Status> {
        if let Some(tls_err) = find_rustls_error(err) {
            return Some(classify_rustls_error(tls_err));
        }
        classify_tls_text(&error_chain(err))
    }

    fn inspect(&self, capture: &HandshakeCapture) -> CertsReport {
        let Some(chain) = capture.get() else {
            return CertsReport::default();
        };

        let now = Utc::now();
        let certificates = chain
            .certificates
            .iter()
            .enumerate()
            .filter_map(|(i, der)| cert_info(i, der, now))
            .collect();

        CertsReport {
            had_tls: true,
            chain_valid: chain.verified,
            certificates,
        }
    }
}

/// Delegates verification to WebPKI and records what the server presented.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    capture: HandshakeCapture,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);

        let mut certificates = Vec::with_capacity(intermediates.len() + 1);
        certificates.push(end_entity.clone().into_owned());
        certificates.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        self.capture.record(PeerChain {
            certificates,
            verified: result.is_ok(),
        });

        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn find_rustls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(inner) = e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
            if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
                return Some(tls);
            }
        }
        current = e.source();
    }
    None
}

fn classify_rustls_error(err: &rustls::Error) -> Status {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                Status::ExpiredCertLeaf
            }
            CertificateError::UnknownIssuer => Status::InvalidTlsUnknownAuthority,
            CertificateError::NotValidForName
            | CertificateError::NotValidForNameContext { .. } => Status::InvalidTlsHostname,
            _ => Status::InvalidTlsCertificate,
        },
        _ => Status::InvalidTlsHandshake,
    }
}

/// Substring fallback for errors whose structure was lost on the way up.
pub fn classify_tls_text(text: &str) -> Option<Status> {
    let text = text.to_ascii_lowercase();
    let status = if text.contains("expired") && text.contains("certificate") {
        Status::ExpiredCertLeaf
    } else if text.contains("unknown authority") || text.contains("unknownissuer") {
        Status::InvalidTlsUnknownAuthority
    } else if text.contains("chain") {
        Status::InvalidTlsChain
    } else if text.contains("hostname") || text.contains("notvalidforname") {
        Status::InvalidTlsHostname
    } else if text.contains("certificate") {
        Status::InvalidTlsCertificate
    } else if text.contains("handshake") {
        Status::InvalidTlsHandshake
    } else if text.contains("tls") {
        Status::InvalidTlsOther
    } else {
        return None;
    };
    Some(status)
}

/// Parse one DER certificate; unparseable entries are skipped.
fn cert_info(position: usize, der: &CertificateDer<'_>, now: DateTime<Utc>) -> Option<CertInfo> {
    let (_, cert) = match X509Certificate::from_der(der.as_ref()) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Skipping unparseable certificate at position {}: {}", position, e);
            return None;
        }
    };

    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)?;
    let days_left = (not_after - now).num_seconds() as f64 / 86_400.0;

    let is_ca = cert
        .basic_constraints()
        .map(|bc| bc.map(|ext| ext.value.ca).unwrap_or(false))
        .unwrap_or(false);

    let mut subject_alt_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                subject_alt_names.push(dns.to_string());
            }
        }
    }

    Some(CertInfo {
        position,
        serial_hex: serial_hex(cert.raw_serial()),
        common_name: first_cn(cert.subject()),
        issuer_cn: first_cn(cert.issuer()),
        not_after,
        days_left,
        is_ca,
        subject_alt_names,
    })
}

fn first_cn(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Uppercase hex of a big-endian serial with the DER sign padding dropped.
fn serial_hex(raw: &[u8]) -> String {
    let first = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let significant = &raw[first..];
    if significant.is_empty() {
        return "0".to_string();
    }
    hex::encode_upper(significant)
}

#[cfg(test)]
pub(crate) mod test_support {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
        SerialNumber,
    };
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    /// A CA and a leaf it signed, as DER.
    pub struct TestPki {
        pub ca: CertificateDer<'static>,
        pub leaf: CertificateDer<'static>,
        pub leaf_key: PrivateKeyDer<'static>,
    }

    pub fn test_pki(leaf_name: &str) -> TestPki {
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Watchdog Test CA");
        ca_params.distinguished_name = dn;
        ca_params.not_after = rcgen::date_time_ymd(2099, 1, 1);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut leaf_params = CertificateParams::new(vec![leaf_name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, leaf_name);
        leaf_params.distinguished_name = dn;
        leaf_params.serial_number = Some(SerialNumber::from_slice(&[0x1F, 0x2E, 0x3D]));
        leaf_params.not_after = rcgen::date_time_ymd(2098, 6, 1);
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca: ca_cert.der().clone(),
            leaf: leaf_cert.der().clone(),
            leaf_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        }
    }
}
