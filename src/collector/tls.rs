//! TLS helpers for the health collector.
//!
//! Homelab services mostly run on self-signed or privately issued
//! certificates, so reachability and expiry checks never verify the chain.
//! They only care that a TLS endpoint answers and when its leaf certificate
//! stops being valid.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Days before expiry at which a certificate starts raising an alert.
pub const SSL_WARN_DAYS: i64 = 14;

/// Certificate verifier that accepts any server certificate.
///
/// Handshake signatures are still checked against the presented key.
#[derive(Debug)]
pub struct AcceptAnyCert(Arc<CryptoProvider>);

impl AcceptAnyCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client config using the ring provider and [`AcceptAnyCert`].
///
/// # Errors
///
/// Returns an error if the provider supports none of the default protocol
/// versions.
pub fn insecure_tls_config() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| OrchestratorError::Collector(format!("tls config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Reads the expiry time of the certificate served at a URL.
pub trait CertInspector: Send + Sync {
    /// `notAfter` of the leaf certificate served at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the endpoint cannot be reached,
    /// or the certificate cannot be parsed.
    fn not_after(&self, url: &str) -> Result<DateTime<Utc>>;
}

/// [`CertInspector`] doing a bare TLS handshake with rustls.
pub struct TlsCertInspector {
    timeout: Duration,
    config: Arc<ClientConfig>,
}

impl TlsCertInspector {
    /// # Errors
    ///
    /// Returns an error if the TLS client config cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            timeout,
            config: insecure_tls_config()?,
        })
    }
}

impl CertInspector for TlsCertInspector {
    fn not_after(&self, url: &str) -> Result<DateTime<Utc>> {
        let parsed =
            Url::parse(url).map_err(|e| OrchestratorError::Collector(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_owned())
            .ok_or_else(|| OrchestratorError::Collector(format!("{url}: no host")))?;
        let port = parsed.port_or_known_default().unwrap_or(443);

        let addr = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| OrchestratorError::Collector(format!("{host}: no address")))?;
        let mut sock = TcpStream::connect_timeout(&addr, self.timeout)?;
        sock.set_read_timeout(Some(self.timeout))?;
        sock.set_write_timeout(Some(self.timeout))?;

        let name = ServerName::try_from(host.clone())
            .map_err(|e| OrchestratorError::Collector(format!("{host}: {e}")))?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), name)
            .map_err(|e| OrchestratorError::Collector(format!("{host}: {e}")))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }

        let leaf = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| OrchestratorError::Collector(format!("{host}: no certificate")))?;
        cert_not_after(leaf.as_ref())
    }
}

/// `notAfter` of a DER-encoded X.509 certificate.
///
/// # Errors
///
/// Returns an error if the certificate cannot be parsed.
pub fn cert_not_after(der: &[u8]) -> Result<DateTime<Utc>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| OrchestratorError::Collector(format!("bad certificate: {e}")))?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| OrchestratorError::Collector(format!("bad notAfter: {timestamp}")))
}

/// Alert for a certificate that has expired or expires within
/// [`SSL_WARN_DAYS`] whole days.
pub fn expiry_alert(label: &str, not_after: DateTime<Utc>, now: DateTime<Utc>) -> Option<String> {
    let left = not_after - now;
    if left < TimeDelta::zero() {
        return Some(format!("{label} SSL expired"));
    }
    let days = left.num_days();
    (days <= SSL_WARN_DAYS).then(|| format!("{label} SSL expires in {days}d"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn self_signed(not_after: (i32, u8, u8)) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(vec!["nas.local".to_owned()]);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        rcgen::Certificate::from_params(params)
            .unwrap()
            .serialize_der()
            .unwrap()
    }

    #[test]
    fn expiry_thresholds() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(expiry_alert("Plex", now + TimeDelta::days(90), now), None);
        assert_eq!(expiry_alert("Plex", now + TimeDelta::days(15), now), None);
        assert_eq!(
            expiry_alert("Plex", now + TimeDelta::days(14), now).as_deref(),
            Some("Plex SSL expires in 14d")
        );
        assert_eq!(
            expiry_alert("Plex", now + TimeDelta::hours(5), now).as_deref(),
            Some("Plex SSL expires in 0d")
        );
        assert_eq!(
            expiry_alert("Plex", now - TimeDelta::minutes(1), now).as_deref(),
            Some("Plex SSL expired")
        );
    }

    #[test]
    fn reads_not_after_from_der() {
        let der = self_signed((2031, 5, 17));
        let not_after = cert_not_after(&der).unwrap();
        assert_eq!(not_after.date_naive().to_string(), "2031-05-17");
    }

    #[test]
    fn garbage_der_is_an_error() {
        assert!(cert_not_after(b"not a certificate").is_err());
    }

    #[test]
    fn self_signed_certificates_are_accepted() {
        let verifier = AcceptAnyCert::new(Arc::new(rustls::crypto::ring::default_provider()));
        let der = CertificateDer::from(self_signed((2031, 5, 17)));
        let name = ServerName::try_from("nas.local").unwrap();
        assert!(
            verifier
                .verify_server_cert(&der, &[], &name, &[], UnixTime::now())
                .is_ok()
        );
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn insecure_config_builds_client_connections() {
        let config = insecure_tls_config().unwrap();
        let name = ServerName::try_from("nas.local").unwrap();
        let conn = ClientConnection::new(config, name).unwrap();
        assert!(conn.is_handshaking());
    }
}
