//! TLS trust bootstrap for the secrets server
//!
//! A run creates one self-signed CA and uses it to sign exactly one server
//! certificate bound to the caller's subject alternative names. Key material
//! is generated fresh on every call and lives only in memory until it is
//! handed to the manifest emitter.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity period for the CA certificate (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for the server certificate (1 year)
pub const CERT_VALIDITY_YEARS: i64 = 1;

/// Organization written into issued subjects
const ORGANIZATION: &str = "unseal-bootstrap";

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Subject alternative names were rejected
    #[error("invalid subject alternative name: {0}")]
    InvalidSan(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// DNS names and IP addresses a server certificate is valid for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAltNames {
    /// DNS names
    #[serde(default)]
    pub dns_names: BTreeSet<String>,
    /// IP addresses
    #[serde(default)]
    pub ip_addresses: BTreeSet<IpAddr>,
}

impl SubjectAltNames {
    /// Classify free-form entries: anything that parses as an IP address is
    /// an IP SAN, everything else a DNS SAN.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sans = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.parse::<IpAddr>() {
                Ok(ip) => {
                    sans.ip_addresses.insert(ip);
                }
                Err(_) => {
                    sans.dns_names.insert(entry.to_string());
                }
            }
        }
        sans
    }

    /// True when no names or addresses are present
    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty() && self.ip_addresses.is_empty()
    }

    fn to_san_types(&self) -> Result<Vec<SanType>> {
        let mut out = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for name in &self.dns_names {
            let ia5 = Ia5String::try_from(name.clone())
                .map_err(|e| PkiError::InvalidSan(format!("DNS name '{}': {}", name, e)))?;
            out.push(SanType::DnsName(ia5));
        }
        out.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        Ok(out)
    }
}

/// Server certificate and its private key, both PEM-encoded
#[derive(Clone)]
pub struct ServerCertificate {
    /// PEM certificate signed by the run's CA
    pub cert_pem: String,
    /// PEM PKCS#8 private key
    pub key_pem: String,
}

impl std::fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Self-signed certificate authority held for the duration of one run
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA with a freshly generated key
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a TLS server certificate whose SANs are exactly `sans`.
    ///
    /// A fresh key pair is generated for the server; the CA key never leaves
    /// this struct.
    pub fn issue_server_certificate(
        &self,
        common_name: &str,
        sans: &SubjectAltNames,
    ) -> Result<ServerCertificate> {
        if sans.is_empty() {
            return Err(PkiError::InvalidSan(
                "server certificate needs at least one DNS name or IP address".to_string(),
            ));
        }

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans.to_san_types()?;

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok(ServerCertificate {
            cert_pem: server_cert.pem(),
            key_pem: server_key.serialize_pem(),
        })
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Read the subject alternative names back out of a PEM certificate
pub fn subject_alt_names(cert_pem: &str) -> Result<SubjectAltNames> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let mut sans = SubjectAltNames::default();
    let ext = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::ParseError(format!("bad SAN extension: {}", e)))?;

    if let Some(ext) = ext {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    sans.dns_names.insert(dns.to_string());
                }
                GeneralName::IPAddress(bytes) => {
                    sans.ip_addresses.insert(ip_from_bytes(bytes)?);
                }
                _ => {}
            }
        }
    }

    Ok(sans)
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes
                .try_into()
                .map_err(|_| PkiError::ParseError("malformed IPv4 SAN".to_string()))?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes
                .try_into()
                .map_err(|_| PkiError::ParseError("malformed IPv6 SAN".to_string()))?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(PkiError::ParseError(format!(
            "IP SAN has unexpected length {}",
            n
        ))),
    }
}

/// Verification result for a server certificate
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Whether the certificate chains to the CA and is currently valid
    pub valid: bool,
    /// Reason if invalid
    pub reason: Option<String>,
}

impl VerificationResult {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Verify a server certificate was signed by the given CA and is in its
/// validity window.
pub fn verify_server_cert(cert_pem: &str, ca_cert_pem: &str) -> Result<VerificationResult> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse server cert: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if !ca_cert.is_ca() {
        return Ok(VerificationResult::invalid("issuer certificate is not a CA"));
    }

    if cert.issuer().to_string() != ca_cert.subject().to_string() {
        return Ok(VerificationResult::invalid("issuer does not match CA subject"));
    }

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(VerificationResult::invalid("signature verification failed"));
    }

    if !cert.validity().is_valid() {
        return Ok(VerificationResult::invalid("certificate outside validity period"));
    }

    Ok(VerificationResult {
        valid: true,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_sans() -> SubjectAltNames {
        SubjectAltNames::from_entries([
            "vault",
            "vault.default.svc.cluster.local",
            "localhost",
            "127.0.0.1",
        ])
    }

    #[test]
    fn ca_can_be_created() {
        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let der = parse_pem(ca.ca_cert_pem()).unwrap();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(cert.is_ca());
    }

    #[test]
    fn entries_are_classified_as_dns_or_ip() {
        let sans = SubjectAltNames::from_entries(["vault", "10.0.0.1", "::1", " ", "localhost"]);
        assert_eq!(sans.dns_names.len(), 2);
        assert!(sans.dns_names.contains("vault"));
        assert!(sans.ip_addresses.contains(&"10.0.0.1".parse().unwrap()));
        assert!(sans.ip_addresses.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn issued_sans_match_input_exactly() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let sans = vault_sans();
        let server = ca.issue_server_certificate("vault", &sans).unwrap();

        let parsed = subject_alt_names(&server.cert_pem).unwrap();
        assert_eq!(parsed, sans);
    }

    #[test]
    fn ipv6_sans_survive_the_round_trip() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let sans = SubjectAltNames::from_entries(["fd00::10", "vault"]);
        let server = ca.issue_server_certificate("vault", &sans).unwrap();
        assert_eq!(subject_alt_names(&server.cert_pem).unwrap(), sans);
    }

    #[test]
    fn server_cert_verifies_against_its_ca() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let server = ca.issue_server_certificate("vault", &vault_sans()).unwrap();

        let result = verify_server_cert(&server.cert_pem, ca.ca_cert_pem()).unwrap();
        assert!(result.valid, "{:?}", result.reason);
        assert!(result.reason.is_none());
    }

    #[test]
    fn server_cert_fails_against_a_different_ca() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let other = CertificateAuthority::new("Test CA").unwrap();
        let server = ca.issue_server_certificate("vault", &vault_sans()).unwrap();

        let result = verify_server_cert(&server.cert_pem, other.ca_cert_pem()).unwrap();
        assert!(!result.valid);
        assert!(result
            .reason
            .expect("reason should be set")
            .contains("signature verification failed"));
    }

    #[test]
    fn server_cert_is_not_a_ca() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let server = ca.issue_server_certificate("vault", &vault_sans()).unwrap();

        let result = verify_server_cert(&server.cert_pem, &server.cert_pem).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn key_material_is_fresh_per_call() {
        let ca1 = CertificateAuthority::new("Test CA").unwrap();
        let ca2 = CertificateAuthority::new("Test CA").unwrap();
        assert_ne!(ca1.ca_cert_pem(), ca2.ca_cert_pem());

        let a = ca1.issue_server_certificate("vault", &vault_sans()).unwrap();
        let b = ca1.issue_server_certificate("vault", &vault_sans()).unwrap();
        assert_ne!(a.key_pem, b.key_pem);
        assert!(a.key_pem.contains("PRIVATE KEY"));
        assert!(!a.cert_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn empty_sans_are_rejected() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let result = ca.issue_server_certificate("vault", &SubjectAltNames::default());
        assert!(matches!(result, Err(PkiError::InvalidSan(_))));
    }

    #[test]
    fn non_ascii_dns_name_is_rejected() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let sans = SubjectAltNames::from_entries(["välidation.example"]);
        let result = ca.issue_server_certificate("vault", &sans);
        assert!(matches!(result, Err(PkiError::InvalidSan(_))));
    }

    #[test]
    fn debug_output_redacts_private_keys() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let server = ca.issue_server_certificate("vault", &vault_sans()).unwrap();
        assert!(!format!("{:?}", server).contains("PRIVATE KEY"));
        assert!(!format!("{:?}", ca).contains("PRIVATE KEY"));
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        assert!(matches!(
            subject_alt_names("not a certificate"),
            Err(PkiError::ParseError(_))
        ));
    }
}
