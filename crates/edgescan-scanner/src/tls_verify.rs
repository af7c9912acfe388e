//! TLS identity verification of a candidate edge
//!
//! Optional pre-check that weeds out candidates that terminate TLS with an
//! unexpected certificate (typically a middlebox). The handshake runs with
//! certificate verification disabled; the decision is made afterwards on the
//! parsed leaf certificate: the issuer organization must be one of the CAs
//! the big CDNs actually use, or the subject CN must name Cloudflare.

use edgescan_core::{Error, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

/// Issuer organizations accepted as genuine CDN edges
const TRUSTED_ISSUER_ORGS: &[&str] = &[
    "Cloudflare",
    "Google Trust Services",
    "Let's Encrypt",
    "DigiCert",
    "GlobalSign",
];

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity extracted from a candidate's leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    pub issuer_org: String,
    pub subject_cn: String,
}

impl CertIdentity {
    /// Whether this certificate looks like a genuine CDN edge
    pub fn is_trusted(&self) -> bool {
        TRUSTED_ISSUER_ORGS
            .iter()
            .any(|org| self.issuer_org.contains(org))
            || self.subject_cn.to_lowercase().contains("cloudflare")
    }
}

/// Accept-everything verifier; the caller inspects the chain itself
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Connect to `ip:port` with TLS (no hostname check) and read the leaf
/// certificate's identity
///
/// `sni` is offered when present so edges that require it still answer with
/// their real certificate; verification is skipped either way.
pub async fn inspect_candidate(ip: IpAddr, port: u16, sni: Option<&str>) -> Result<CertIdentity> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = sni
        .and_then(|s| ServerName::try_from(s).ok())
        .or_else(|| ServerName::try_from(ip.to_string().as_str()).ok())
        .ok_or_else(|| Error::Network("cannot build TLS server name".to_string()))?;

    let handshake = async {
        let tcp = TcpStream::connect((ip, port))
            .await
            .map_err(|e| Error::Network(format!("TCP connect failed: {}", e)))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Network(format!("TLS handshake failed: {}", e)))
    };

    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| Error::Timeout)??;

    let (_, conn) = tls.get_ref();
    let certs = conn
        .peer_certificates()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Network("no peer certificate presented".to_string()))?;

    parse_identity(&certs[0].0)
}

/// Extract issuer organization and subject CN from a DER certificate
pub fn parse_identity(der: &[u8]) -> Result<CertIdentity> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Parse(format!("certificate parse failed: {}", e)))?;

    let issuer_org = cert
        .issuer()
        .iter_organization()
        .filter_map(|attr| attr.as_str().ok())
        .next()
        .unwrap_or("")
        .to_string();

    let subject_cn = cert
        .subject()
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .next()
        .unwrap_or("")
        .to_string();

    Ok(CertIdentity {
        issuer_org,
        subject_cn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(issuer: &str, cn: &str) -> CertIdentity {
        CertIdentity {
            issuer_org: issuer.to_string(),
            subject_cn: cn.to_string(),
        }
    }

    #[test]
    fn test_trusted_issuers() {
        assert!(identity("Cloudflare, Inc.", "example.com").is_trusted());
        assert!(identity("Google Trust Services LLC", "x.dev").is_trusted());
        assert!(identity("Let's Encrypt", "a.b").is_trusted());
        assert!(identity("DigiCert Inc", "a.b").is_trusted());
        assert!(identity("GlobalSign nv-sa", "a.b").is_trusted());
    }

    #[test]
    fn test_cloudflare_cn_rescues_unknown_issuer() {
        assert!(identity("Some Regional CA", "sni.cloudflaressl.com").is_trusted());
        assert!(identity("", "CLOUDFLARE-DNS.com").is_trusted());
    }

    #[test]
    fn test_untrusted_identity() {
        assert!(!identity("Evil CA", "mitm.example").is_trusted());
        assert!(!identity("", "").is_trusted());
    }

    #[test]
    fn test_parse_identity_rejects_garbage() {
        assert!(parse_identity(&[0x30, 0x00]).is_err());
        assert!(parse_identity(b"not a certificate").is_err());
    }
}
