//! X.509 certificates for node identities.
//!
//! A [`Certificate`] is an owned DER/PEM pair plus the handful of fields the
//! rest of the crate inspects (serial, subject, issuer, validity), parsed
//! once with `x509-parser`. Issuance parameters for each [`KeyRole`] are
//! built here; signing happens in [`crate::authority`].
//!
//! Reference: `rcgen` crate (rustls team, MIT/Apache-2.0)
//! <https://github.com/rustls/rcgen>

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, SerialNumber};
use rand::RngCore;
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{KeyError, Result};
use crate::identity::KeyRole;

/// Rotation threshold as a fraction of validity.
const ROTATION_THRESHOLD: f64 = 0.75;

/// Length of generated serial numbers in bytes.
const SERIAL_LEN: usize = 16;

/// A parsed, owned X.509 certificate.
#[derive(Clone)]
pub struct Certificate {
    cert_der: Vec<u8>,
    cert_pem: String,
    serial: Vec<u8>,
    subject: String,
    issuer: String,
    not_before_epoch: i64,
    not_after_epoch: i64,
}

impl Certificate {
    /// Parse a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| KeyError::CertificateVerification(format!("X.509 parse error: {e}")))?;

        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.to_vec()));

        Ok(Self {
            cert_der: der.to_vec(),
            cert_pem,
            serial: cert.tbs_certificate.raw_serial().to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before_epoch: cert.validity().not_before.timestamp(),
            not_after_epoch: cert.validity().not_after.timestamp(),
        })
    }

    /// Returns true if the certificate should be rotated (past 75% of validity).
    pub fn needs_rotation(&self, now_epoch_secs: i64) -> bool {
        let total = (self.not_after_epoch - self.not_before_epoch) as f64;
        let elapsed = (now_epoch_secs - self.not_before_epoch) as f64;
        if total <= 0.0 {
            return true;
        }
        elapsed / total >= ROTATION_THRESHOLD
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Returns the DER-encoded certificate bytes.
    pub fn der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Returns the PEM-encoded certificate string.
    pub fn pem(&self) -> &str {
        &self.cert_pem
    }

    /// Big-endian serial number bytes as encoded in the certificate.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn not_before_epoch(&self) -> i64 {
        self.not_before_epoch
    }

    /// Returns the expiration time as seconds since Unix epoch.
    pub fn not_after_epoch(&self) -> i64 {
        self.not_after_epoch
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("not_after_epoch", &self.not_after_epoch)
            .finish_non_exhaustive()
    }
}

/// Build issuance parameters for a role-specific certificate valid from
/// `now_epoch_secs` for the role's validity window.
pub(crate) fn role_params(
    role: KeyRole,
    common_name: &str,
    now_epoch_secs: i64,
) -> Result<CertificateParams> {
    let generation = |message: String| KeyError::CertificateGeneration {
        role: role.name(),
        message,
    };

    let not_before = OffsetDateTime::from_unix_timestamp(now_epoch_secs)
        .map_err(|e| generation(format!("invalid not_before: {e}")))?;
    let not_after =
        OffsetDateTime::from_unix_timestamp(now_epoch_secs + role.validity_days() * 86400)
            .map_err(|e| generation(format!("invalid not_after: {e}")))?;

    // TLS certificates carry the node name as a SAN so gRPC clients can
    // address the node by name.
    let sans = match role {
        KeyRole::Tls => vec![common_name.to_string()],
        KeyRole::Signing | KeyRole::Agreement => vec![],
    };
    let mut params =
        CertificateParams::new(sans).map_err(|e| generation(format!("invalid cert params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params.key_usages = role.key_usages();
    params.extended_key_usages = role.extended_key_usages();
    params.is_ca = if role.is_ca() {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::ExplicitNoCa
    };

    Ok(params)
}

/// Random positive serial with a non-zero leading byte, so the DER INTEGER
/// encoding is exactly [`SERIAL_LEN`] bytes.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference epoch: 2025-01-01 00:00:00 UTC.
    const JAN_1_2025: i64 = 1735689600;

    fn issue(role: KeyRole) -> Certificate {
        let key = rcgen::KeyPair::generate_for(role.algorithm().rcgen()).expect("keygen");
        let params = role_params(role, "node0", JAN_1_2025).expect("params");
        let cert = params.self_signed(&key).expect("self-signed");
        Certificate::from_der(cert.der()).expect("parse")
    }

    #[test]
    fn parses_subject_and_validity() {
        let cert = issue(KeyRole::Tls);
        assert_eq!(cert.subject(), "CN=node0");
        assert!(cert.is_self_issued());
        assert_eq!(cert.not_before_epoch(), JAN_1_2025);
        assert_eq!(
            cert.not_after_epoch(),
            JAN_1_2025 + KeyRole::Tls.validity_days() * 86400
        );
    }

    #[test]
    fn serial_is_sixteen_positive_bytes() {
        let cert = issue(KeyRole::Signing);
        assert_eq!(cert.serial().len(), SERIAL_LEN);
        assert_eq!(cert.serial()[0] & 0x80, 0);
    }

    #[test]
    fn serials_differ_between_certificates() {
        assert_ne!(
            issue(KeyRole::Signing).serial(),
            issue(KeyRole::Signing).serial()
        );
    }

    #[test]
    fn pem_round_trips_der() {
        let cert = issue(KeyRole::Agreement);
        assert!(cert.pem().starts_with("-----BEGIN CERTIFICATE-----"));
        let parsed = pem::parse(cert.pem()).expect("pem");
        assert_eq!(parsed.contents(), cert.der());
    }

    #[test]
    fn rotation_thresholds() {
        let cert = issue(KeyRole::Tls);
        let validity = KeyRole::Tls.validity_days() * 86400;
        assert!(!cert.needs_rotation(JAN_1_2025));
        assert!(!cert.needs_rotation(JAN_1_2025 + validity / 2));
        assert!(cert.needs_rotation(JAN_1_2025 + validity * 3 / 4 + 1));
        assert!(cert.needs_rotation(JAN_1_2025 + validity));
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(Certificate::from_der(b"not a certificate").is_err());
        assert!(Certificate::from_der(b"").is_err());
    }
}
