//! Node key pairs: a private key, its certificate and the certificate chain.
//!
//! Private keys are held as `rcgen` key pairs (ring backend) and exported as
//! PKCS#8 for PEM files, `rustls` identities and ring signing. The chain
//! lists issuer certificates leaf-first; it is empty for self-signed roles.

use ring::rand::SystemRandom;
use ring::signature::EcdsaKeyPair;
use rustls_pki_types::PrivatePkcs8KeyDer;

use crate::error::{KeyError, Result};
use crate::identity::{Certificate, KeyRole, NodeAlias};

/// One role's key material for one node.
pub struct NodeKey {
    node: NodeAlias,
    role: KeyRole,
    key_pair: rcgen::KeyPair,
    certificate: Certificate,
    chain: Vec<Certificate>,
}

impl NodeKey {
    /// Assemble a node key, checking that the private key belongs to the
    /// certificate's public key.
    pub fn new(
        node: NodeAlias,
        role: KeyRole,
        key_pair: rcgen::KeyPair,
        certificate: Certificate,
        chain: Vec<Certificate>,
    ) -> Result<Self> {
        let cert_key = crate::verify::public_key_bytes(certificate.der())?;
        if cert_key != key_pair.public_key_raw() {
            return Err(KeyError::CertificateVerification(format!(
                "{role} private key for {node} does not match its certificate"
            )));
        }
        Ok(Self {
            node,
            role,
            key_pair,
            certificate,
            chain,
        })
    }

    /// Rebuild an `rcgen` key pair from PKCS#8 DER for the given role.
    pub(crate) fn key_pair_from_pkcs8(role: KeyRole, pkcs8_der: &[u8]) -> Result<rcgen::KeyPair> {
        let pkcs8 = PrivatePkcs8KeyDer::from(pkcs8_der.to_vec());
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, role.algorithm().rcgen()).map_err(
            |e| KeyError::KeyGeneration {
                role: role.name(),
                message: format!("PKCS#8 import: {e}"),
            },
        )
    }

    pub fn node(&self) -> &NodeAlias {
        &self.node
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Issuer certificates, leaf-first. Empty for self-signed roles.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub(crate) fn key_pair(&self) -> &rcgen::KeyPair {
        &self.key_pair
    }

    /// PKCS#8 DER encoding of the private key.
    pub fn private_key_der(&self) -> Vec<u8> {
        self.key_pair.serialize_der()
    }

    /// PKCS#8 PEM encoding of the private key.
    pub fn private_key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Raw public key bytes (uncompressed EC point).
    pub fn public_key_raw(&self) -> &[u8] {
        self.key_pair.public_key_raw()
    }

    /// Certificate followed by its chain, PEM-encoded.
    pub fn certificate_chain_pem(&self) -> String {
        std::iter::once(&self.certificate)
            .chain(self.chain.iter())
            .map(Certificate::pem)
            .collect()
    }

    /// Sign `message` with the private key (ASN.1 DER ECDSA signature).
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let signer = EcdsaKeyPair::from_pkcs8(
            self.role.algorithm().ring_signing(),
            &self.private_key_der(),
            &rng,
        )
        .map_err(|e| KeyError::KeyGeneration {
            role: self.role.name(),
            message: format!("signing key rejected: {e}"),
        })?;

        let signature = signer
            .sign(&rng, message)
            .map_err(|_| KeyError::KeyGeneration {
                role: self.role.name(),
                message: "signature generation failed".into(),
            })?;
        Ok(signature.as_ref().to_vec())
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("node", &self.node)
            .field("role", &self.role)
            .field("certificate", &self.certificate)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}
