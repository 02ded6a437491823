//! Certificate authority for per-node key material.
//!
//! [`KeyManager`] generates, stores and loads the three key pairs every node
//! owns. It never retries: generation and verification failures reproduce
//! with identical inputs, so they are returned to the caller as-is.
//!
//! PEM layout: the private key file holds one PKCS#8 block; the certificate
//! file holds the leaf certificate followed by its chain. When both names
//! point at the same file the bundle is written certificate-first with the
//! private key last, and loading always takes the **last** PEM block of the
//! private key file as the key.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::CertificateParams;
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{KeyError, Result};
use crate::identity::certificate::role_params;
use crate::identity::{Certificate, KeyFileNames, KeyRole, NodeAlias, NodeKey};
use crate::verify;

/// PEM tag of PKCS#8 private keys.
const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Generates, stores and loads node key pairs.
#[derive(Clone)]
pub struct KeyManager {
    clock: fn() -> i64,
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyManager {
    pub fn new() -> Self {
        Self {
            clock: system_now_epoch_secs,
        }
    }

    /// Use a fixed clock (seconds since Unix epoch) for certificate validity.
    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self { clock }
    }

    /// Generate a self-signed signing key pair.
    pub fn generate_signing_key(&self, node: &NodeAlias) -> Result<NodeKey> {
        let role = KeyRole::Signing;
        let key_pair = generate_key_pair(role)?;
        let cert = role_params(role, &role.common_name(node), (self.clock)())?
            .self_signed(&key_pair)
            .map_err(|e| issue_error(role, e))?;
        let certificate = Certificate::from_der(cert.der())?;

        debug!(%node, %role, subject = certificate.subject(), "generated key pair");
        NodeKey::new(node.clone(), role, key_pair, certificate, Vec::new())
    }

    /// Generate an agreement key pair whose certificate is issued by
    /// `signing_key`.
    ///
    /// The issued certificate is verified against the signing key before it
    /// is returned. A verification failure means the signing key material is
    /// corrupt and is reported as [`KeyError::CertificateVerification`].
    pub fn generate_agreement_key(
        &self,
        node: &NodeAlias,
        signing_key: &NodeKey,
    ) -> Result<NodeKey> {
        let role = KeyRole::Agreement;
        if signing_key.role() != KeyRole::Signing {
            return Err(KeyError::CertificateGeneration {
                role: role.name(),
                message: format!("issuer must be a signing key, got {}", signing_key.role()),
            });
        }

        let issuer_der = CertificateDer::from(signing_key.certificate().der().to_vec());
        let issuer = CertificateParams::from_ca_cert_der(&issuer_der)
            .and_then(|params| params.self_signed(signing_key.key_pair()))
            .map_err(|e| issue_error(role, e))?;

        let key_pair = generate_key_pair(role)?;
        let cert = role_params(role, &role.common_name(node), (self.clock)())?
            .signed_by(&key_pair, &issuer, signing_key.key_pair())
            .map_err(|e| issue_error(role, e))?;
        let certificate = Certificate::from_der(cert.der())?;

        verify::verify_issued_by(&certificate, signing_key.certificate())?;

        debug!(%node, %role, issuer = certificate.issuer(), "generated key pair");
        NodeKey::new(
            node.clone(),
            role,
            key_pair,
            certificate,
            vec![signing_key.certificate().clone()],
        )
    }

    /// Generate a self-signed gRPC TLS key pair with server and client
    /// extended key usage. `distinguished_name` becomes the certificate's
    /// common name and DNS subject alternative name.
    pub fn generate_grpc_tls_key(
        &self,
        node: &NodeAlias,
        distinguished_name: &str,
    ) -> Result<NodeKey> {
        let role = KeyRole::Tls;
        if distinguished_name.is_empty() {
            return Err(KeyError::MissingArgument("distinguished name"));
        }

        let key_pair = generate_key_pair(role)?;
        let cert = role_params(role, distinguished_name, (self.clock)())?
            .self_signed(&key_pair)
            .map_err(|e| issue_error(role, e))?;
        let certificate = Certificate::from_der(cert.der())?;

        debug!(%node, %role, subject = certificate.subject(), "generated key pair");
        NodeKey::new(node.clone(), role, key_pair, certificate, Vec::new())
    }

    /// Write a node key to `directory`.
    ///
    /// An existing certificate file is removed before the chain is written,
    /// so repeated regeneration never grows the bundle.
    pub fn store_node_key(
        &self,
        key: &NodeKey,
        directory: &Path,
        file_names: &KeyFileNames,
    ) -> Result<()> {
        fs::create_dir_all(directory).map_err(|e| KeyError::io(directory, e))?;

        let key_path = directory.join(&file_names.private_key);
        let cert_path = directory.join(&file_names.certificate);

        if cert_path.exists() {
            fs::remove_file(&cert_path).map_err(|e| KeyError::io(&cert_path, e))?;
        }

        if key_path == cert_path {
            let bundle = format!("{}{}", key.certificate_chain_pem(), key.private_key_pem());
            write_private(&key_path, &bundle)?;
        } else {
            write_private(&key_path, &key.private_key_pem())?;
            fs::write(&cert_path, key.certificate_chain_pem())
                .map_err(|e| KeyError::io(&cert_path, e))?;
        }

        debug!(
            node = %key.node(),
            role = %key.role(),
            path = %directory.display(),
            "stored key pair"
        );
        Ok(())
    }

    /// Load a node key from `directory`, verifying that the private key
    /// matches the certificate and that the chain is intact.
    pub fn load_node_key(
        &self,
        node: &NodeAlias,
        directory: &Path,
        role: KeyRole,
        file_names: &KeyFileNames,
    ) -> Result<NodeKey> {
        let key_path = directory.join(&file_names.private_key);
        let key_blocks = read_pem_blocks(&key_path)?;
        let key_block = key_blocks.last().ok_or_else(|| KeyError::MalformedKey {
            path: key_path.clone(),
            message: "no PEM blocks".into(),
        })?;
        if key_block.tag() != PRIVATE_KEY_TAG {
            return Err(KeyError::MalformedKey {
                path: key_path,
                message: format!("last PEM block is '{}', expected a private key", key_block.tag()),
            });
        }
        let key_pair = NodeKey::key_pair_from_pkcs8(role, key_block.contents())?;

        let cert_path = directory.join(&file_names.certificate);
        let mut certs = read_pem_blocks(&cert_path)?
            .into_iter()
            .filter(|block| block.tag() == CERTIFICATE_TAG)
            .map(|block| Certificate::from_der(block.contents()));
        let certificate = certs.next().ok_or_else(|| KeyError::MalformedKey {
            path: cert_path.clone(),
            message: "no certificate block".into(),
        })??;
        let chain = certs.collect::<Result<Vec<_>>>()?;

        verify::verify_chain(&certificate, &chain)?;
        NodeKey::new(node.clone(), role, key_pair, certificate, chain)
    }

    /// Generate and store the signing and agreement keys for `node`.
    pub fn generate_gossip_pem_keys(
        &self,
        node: &NodeAlias,
        directory: &Path,
    ) -> Result<(NodeKey, NodeKey)> {
        let signing = self.generate_signing_key(node)?;
        self.store_node_key(&signing, directory, &KeyRole::Signing.file_names(node))?;

        let agreement = self.generate_agreement_key(node, &signing)?;
        self.store_node_key(&agreement, directory, &KeyRole::Agreement.file_names(node))?;

        info!(%node, path = %directory.display(), "gossip keys generated");
        Ok((signing, agreement))
    }

    /// Generate and store the gRPC TLS key for `node`, checking that it forms
    /// a usable TLS server identity first.
    pub fn generate_tls_pem_key(&self, node: &NodeAlias, directory: &Path) -> Result<NodeKey> {
        let tls = self.generate_grpc_tls_key(node, &KeyRole::Tls.common_name(node))?;
        crate::tls::server_identity(&tls)?;
        self.store_node_key(&tls, directory, &KeyRole::Tls.file_names(node))?;

        info!(%node, path = %directory.display(), "TLS key generated");
        Ok(tls)
    }

    /// True when both PEM files for `role` exist in `directory`.
    pub fn has_pem_key(node: &NodeAlias, directory: &Path, role: KeyRole) -> bool {
        let names = role.file_names(node);
        directory.join(names.private_key).is_file() && directory.join(names.certificate).is_file()
    }

    /// Paths of the PEM files for `roles`, private key first per role.
    pub fn pem_key_paths(node: &NodeAlias, directory: &Path, roles: &[KeyRole]) -> Vec<PathBuf> {
        roles
            .iter()
            .flat_map(|role| {
                let names = role.file_names(node);
                [
                    directory.join(names.private_key),
                    directory.join(names.certificate),
                ]
            })
            .collect()
    }
}

fn system_now_epoch_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn generate_key_pair(role: KeyRole) -> Result<rcgen::KeyPair> {
    rcgen::KeyPair::generate_for(role.algorithm().rcgen()).map_err(|e| KeyError::KeyGeneration {
        role: role.name(),
        message: e.to_string(),
    })
}

fn issue_error(role: KeyRole, e: rcgen::Error) -> KeyError {
    KeyError::CertificateGeneration {
        role: role.name(),
        message: e.to_string(),
    }
}

fn read_pem_blocks(path: &Path) -> Result<Vec<pem::Pem>> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyError::MissingKeyMaterial(path.to_path_buf()),
        _ => KeyError::io(path, e),
    })?;
    pem::parse_many(&text).map_err(|e| KeyError::MalformedKey {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Write a private key file readable only by the owner.
fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| KeyError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| KeyError::io(path, e))?;
    }

    Ok(())
}
