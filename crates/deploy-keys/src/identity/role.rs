//! Key roles and the algorithm parameters each role carries.
//!
//! Every node owns exactly one key pair per [`KeyRole`]. The role decides the
//! signature algorithm, file names, certificate extensions and validity
//! window, so callers select behaviour by matching on the role instead of
//! passing file prefixes around.

use std::fmt;

use rcgen::{ExtendedKeyUsagePurpose, KeyUsagePurpose, SignatureAlgorithm};
use serde::{Deserialize, Serialize};

use crate::identity::NodeAlias;

const DAYS_PER_YEAR: i64 = 365;

/// Signing and agreement certificates outlive any realistic network.
const GOSSIP_VALIDITY_DAYS: i64 = 100 * DAYS_PER_YEAR;

/// TLS certificates are rotated through `update` long before this.
const TLS_VALIDITY_DAYS: i64 = 10 * DAYS_PER_YEAR;

/// Asymmetric algorithm used for a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA over secp384r1 with SHA-384.
    EcdsaP384,
    /// ECDSA over prime256v1 with SHA-256.
    EcdsaP256,
}

impl KeyAlgorithm {
    pub(crate) fn rcgen(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        }
    }

    pub(crate) fn ring_signing(self) -> &'static ring::signature::EcdsaSigningAlgorithm {
        match self {
            Self::EcdsaP384 => &ring::signature::ECDSA_P384_SHA384_ASN1_SIGNING,
            Self::EcdsaP256 => &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
        }
    }

    pub(crate) fn ring_verification(self) -> &'static ring::signature::EcdsaVerificationAlgorithm {
        match self {
            Self::EcdsaP384 => &ring::signature::ECDSA_P384_SHA384_ASN1,
            Self::EcdsaP256 => &ring::signature::ECDSA_P256_SHA256_ASN1,
        }
    }

    /// `keytool -genkeypair` arguments selecting this algorithm.
    pub fn keytool_args(self) -> [&'static str; 6] {
        match self {
            Self::EcdsaP384 => [
                "-keyalg",
                "EC",
                "-groupname",
                "secp384r1",
                "-sigalg",
                "SHA384withECDSA",
            ],
            Self::EcdsaP256 => [
                "-keyalg",
                "EC",
                "-groupname",
                "secp256r1",
                "-sigalg",
                "SHA256withECDSA",
            ],
        }
    }
}

/// File names of one key pair inside a key directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFileNames {
    pub private_key: String,
    pub certificate: String,
}

/// The three identities every node owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyRole {
    /// Self-signed gossip signing key; the only role allowed to sign
    /// other certificates.
    Signing,
    /// Gossip agreement key, certified by the node's own signing key.
    Agreement,
    /// Self-signed gRPC TLS key with server and client usage.
    Tls,
}

impl KeyRole {
    pub const ALL: [KeyRole; 3] = [KeyRole::Signing, KeyRole::Agreement, KeyRole::Tls];

    /// Roles carried by the gossip key material (as opposed to TLS).
    pub const GOSSIP: [KeyRole; 2] = [KeyRole::Signing, KeyRole::Agreement];

    pub fn name(self) -> &'static str {
        match self {
            Self::Signing => "signing",
            Self::Agreement => "agreement",
            Self::Tls => "tls",
        }
    }

    pub fn algorithm(self) -> KeyAlgorithm {
        match self {
            Self::Signing | Self::Agreement => KeyAlgorithm::EcdsaP384,
            Self::Tls => KeyAlgorithm::EcdsaP256,
        }
    }

    pub fn validity_days(self) -> i64 {
        match self {
            Self::Signing | Self::Agreement => GOSSIP_VALIDITY_DAYS,
            Self::Tls => TLS_VALIDITY_DAYS,
        }
    }

    /// PEM file names for this role: `s-private-node0.pem`/`s-public-node0.pem`
    /// for gossip keys, `hedera-node0.key`/`hedera-node0.crt` for TLS.
    pub fn file_names(self, node: &NodeAlias) -> KeyFileNames {
        match self {
            Self::Signing | Self::Agreement => {
                let prefix = self.gossip_prefix();
                KeyFileNames {
                    private_key: format!("{prefix}-private-{node}.pem"),
                    certificate: format!("{prefix}-public-{node}.pem"),
                }
            }
            Self::Tls => KeyFileNames {
                private_key: format!("hedera-{node}.key"),
                certificate: format!("hedera-{node}.crt"),
            },
        }
    }

    /// Default certificate common name, e.g. `s-node0`.
    pub fn common_name(self, node: &NodeAlias) -> String {
        match self {
            Self::Signing | Self::Agreement => format!("{}-{node}", self.gossip_prefix()),
            Self::Tls => node.to_string(),
        }
    }

    pub(crate) fn is_ca(self) -> bool {
        matches!(self, Self::Signing)
    }

    pub(crate) fn key_usages(self) -> Vec<KeyUsagePurpose> {
        match self {
            Self::Signing => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
            ],
            Self::Agreement => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyAgreement,
            ],
            Self::Tls => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyAgreement,
            ],
        }
    }

    pub(crate) fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::Tls => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            Self::Signing | Self::Agreement => Vec::new(),
        }
    }

    fn gossip_prefix(self) -> &'static str {
        match self {
            Self::Signing => "s",
            Self::Agreement => "a",
            Self::Tls => "hedera",
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
