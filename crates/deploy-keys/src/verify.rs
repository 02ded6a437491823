//! Certificate and signature verification.
//!
//! Used after issuing an agreement certificate (the signature must verify
//! against the signing key before the key is handed out), when loading key
//! material from disk, and by callers that want to check a signature made
//! with a node key.
//!
//! Reference: `x509-parser` crate (rusticata, MIT/Apache-2.0), `verify`
//! feature backed by ring.

use ring::signature::UnparsedPublicKey;
use x509_parser::oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{KeyError, Result};
use crate::identity::{Certificate, KeyAlgorithm};

fn parse(cert_der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| KeyError::CertificateVerification(format!("X.509 parse error: {e}")))?;
    Ok(cert)
}

/// Extract the raw EC public key (uncompressed point) from a DER-encoded
/// X.509 certificate.
///
/// Returns an error if the certificate cannot be parsed or does not carry
/// an `id-ecPublicKey` subject public key.
pub fn public_key_bytes(cert_der: &[u8]) -> Result<Vec<u8>> {
    let cert = parse(cert_der)?;
    let spki = cert.public_key();

    if spki.algorithm.algorithm != OID_KEY_TYPE_EC_PUBLIC_KEY {
        return Err(KeyError::CertificateVerification(format!(
            "expected EC public key (1.2.840.10045.2.1), got {}",
            spki.algorithm.algorithm
        )));
    }

    Ok(spki.subject_public_key.as_ref().to_vec())
}

/// Verify that `child` was issued by `issuer`: the issuer name matches the
/// issuer's subject and the signature verifies under the issuer's key.
pub fn verify_issued_by(child: &Certificate, issuer: &Certificate) -> Result<()> {
    let child_x = parse(child.der())?;
    let issuer_x = parse(issuer.der())?;

    if child_x.issuer().as_raw() != issuer_x.subject().as_raw() {
        return Err(KeyError::CertificateVerification(format!(
            "issuer '{}' does not match subject '{}'",
            child_x.issuer(),
            issuer_x.subject()
        )));
    }

    child_x
        .verify_signature(Some(issuer_x.public_key()))
        .map_err(|e| {
            KeyError::CertificateVerification(format!(
                "signature on '{}' does not verify under '{}': {e}",
                child_x.subject(),
                issuer_x.subject()
            ))
        })
}

/// Verify a self-signed certificate's signature.
pub fn verify_self_signed(cert: &Certificate) -> Result<()> {
    verify_issued_by(cert, cert)
}

/// Walk `leaf → chain[0] → … → chain[n-1]`, checking every link, and
/// require the final certificate to be self-signed.
pub fn verify_chain(leaf: &Certificate, chain: &[Certificate]) -> Result<()> {
    let mut current = leaf;
    for issuer in chain {
        verify_issued_by(current, issuer)?;
        current = issuer;
    }
    verify_self_signed(current)
}

/// Verify an ASN.1 ECDSA `signature` over `message` with the public key in
/// `cert_der`.
pub fn verify_signature(
    cert_der: &[u8],
    algorithm: KeyAlgorithm,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let public_key = public_key_bytes(cert_der)?;
    UnparsedPublicKey::new(algorithm.ring_verification(), &public_key)
        .verify(message, signature)
        .map_err(|_| KeyError::CertificateVerification("signature does not verify".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::certificate::role_params;
    use crate::identity::KeyRole;

    const JAN_1_2025: i64 = 1735689600;

    fn self_signed(role: KeyRole, cn: &str) -> (rcgen::KeyPair, Certificate) {
        let key = rcgen::KeyPair::generate_for(role.algorithm().rcgen()).expect("keygen");
        let cert = role_params(role, cn, JAN_1_2025)
            .expect("params")
            .self_signed(&key)
            .expect("self-signed");
        let parsed = Certificate::from_der(cert.der()).expect("parse");
        (key, parsed)
    }

    #[test]
    fn extracted_key_matches_key_pair() {
        let (key, cert) = self_signed(KeyRole::Signing, "s-node0");
        let extracted = public_key_bytes(cert.der()).expect("extract");
        assert_eq!(extracted, key.public_key_raw());
    }

    #[test]
    fn self_signed_certificate_verifies() {
        let (_, cert) = self_signed(KeyRole::Tls, "node0");
        assert!(verify_self_signed(&cert).is_ok());
        assert!(verify_chain(&cert, &[]).is_ok());
    }

    #[test]
    fn unrelated_certificate_is_not_an_issuer() {
        let (_, a) = self_signed(KeyRole::Signing, "s-node0");
        let (_, b) = self_signed(KeyRole::Signing, "s-node1");
        assert!(verify_issued_by(&a, &b).is_err());
    }

    #[test]
    fn same_name_different_key_fails_signature_check() {
        let (_, a) = self_signed(KeyRole::Signing, "s-node0");
        let (_, b) = self_signed(KeyRole::Signing, "s-node0");
        let err = verify_issued_by(&a, &b).unwrap_err();
        assert!(matches!(err, KeyError::CertificateVerification(_)));
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(public_key_bytes(b"not a certificate").is_err());
        assert!(public_key_bytes(b"").is_err());
    }
}
