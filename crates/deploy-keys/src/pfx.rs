//! PKCS#12 key containers.
//!
//! Each node owns `private-<node>.pfx` holding its signing (`s`), agreement
//! (`a`) and encryption (`e`) key pairs. The agreement and encryption
//! certificates are issued by the signing key. The network shares one
//! `public.pfx` with every live node's public certificates under
//! `<prefix>-public-<node>` aliases.
//!
//! All keystore work goes through a [`KeyTool`]. Private containers are
//! independent per node. The shared public container is only mutated
//! through [`PublicCertificateStore`], which serializes writers and touches
//! only the aliases of the node being updated.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{KeyError, Result};
use crate::fingerprint::Fingerprint;
use crate::identity::{Certificate, KeyAlgorithm, KeyRole, NodeAlias};
use crate::keytool::{KeyPairSpec, KeyTool, Keystore};
use crate::verify;

/// File name of the shared public container.
pub const PUBLIC_PFX: &str = "public.pfx";

/// Default password of generated containers.
pub const DEFAULT_PFX_PASSWORD: &str = "password";

/// File name of a node's private container.
pub fn private_pfx_name(node: &NodeAlias) -> String {
    format!("private-{node}.pfx")
}

/// Key pair entries of a private container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfxEntry {
    Signing,
    Agreement,
    Encryption,
}

impl PfxEntry {
    pub const ALL: [PfxEntry; 3] = [PfxEntry::Signing, PfxEntry::Agreement, PfxEntry::Encryption];

    fn prefix(self) -> &'static str {
        match self {
            Self::Signing => "s",
            Self::Agreement => "a",
            Self::Encryption => "e",
        }
    }

    /// Alias in the node's private container, e.g. `s-private-node0`.
    pub fn private_alias(self, node: &NodeAlias) -> String {
        format!("{}-private-{node}", self.prefix())
    }

    /// Alias in the shared public container, e.g. `s-public-node0`.
    pub fn public_alias(self, node: &NodeAlias) -> String {
        format!("{}-public-{node}", self.prefix())
    }

    fn common_name(self, node: &NodeAlias) -> String {
        format!("{}-{node}", self.prefix())
    }

    // Every container entry is a gossip-class key.
    fn algorithm(self) -> KeyAlgorithm {
        KeyRole::Signing.algorithm()
    }

    fn validity_days(self) -> i64 {
        KeyRole::Signing.validity_days()
    }
}

/// Handle on the shared `public.pfx`.
///
/// Writers hold the internal lock for the whole alias group of one node, so
/// concurrent updates for different nodes never interleave. Clones share
/// the lock.
#[derive(Clone)]
pub struct PublicCertificateStore {
    keystore: Keystore,
    lock: Arc<Mutex<()>>,
}

impl PublicCertificateStore {
    pub fn new(key_dir: &Path, password: &str) -> Self {
        Self {
            keystore: Keystore::new(key_dir.join(PUBLIC_PFX), password),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        self.keystore.path()
    }

    /// Import `certs` (alias → PEM), replacing any entry already stored
    /// under the same alias. Other aliases are left untouched.
    pub fn replace_entries(&self, tool: &dyn KeyTool, certs: &[(String, Vec<u8>)]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = tool.list_aliases(&self.keystore)?;
        for (alias, pem) in certs {
            if existing.iter().any(|a| a == alias) {
                tool.delete_entry(&self.keystore, alias)?;
            }
            tool.import_cert(&self.keystore, alias, pem)?;
            debug!(alias = %alias, path = %self.path().display(), "imported public certificate");
        }
        Ok(())
    }

    /// Delete `aliases` that are present. Returns the aliases removed.
    pub fn remove_entries(&self, tool: &dyn KeyTool, aliases: &[String]) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = tool.list_aliases(&self.keystore)?;
        let mut removed = Vec::new();
        for alias in aliases.iter().filter(|a| existing.contains(a)) {
            tool.delete_entry(&self.keystore, alias)?;
            removed.push(alias.clone());
        }
        Ok(removed)
    }

    pub fn aliases(&self, tool: &dyn KeyTool) -> Result<Vec<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        tool.list_aliases(&self.keystore)
    }
}

/// Generates per-node PKCS#12 containers and maintains `public.pfx`.
#[derive(Clone)]
pub struct PfxKeyManager {
    tool: Arc<dyn KeyTool>,
    key_dir: PathBuf,
    password: String,
    public: PublicCertificateStore,
}

impl PfxKeyManager {
    pub fn new(tool: Arc<dyn KeyTool>, key_dir: impl Into<PathBuf>, password: &str) -> Self {
        let key_dir = key_dir.into();
        let public = PublicCertificateStore::new(&key_dir, password);
        Self {
            tool,
            key_dir,
            password: password.to_string(),
            public,
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    pub fn public_store(&self) -> &PublicCertificateStore {
        &self.public
    }

    pub fn private_pfx_path(&self, node: &NodeAlias) -> PathBuf {
        self.key_dir.join(private_pfx_name(node))
    }

    fn private_keystore(&self, node: &NodeAlias) -> Keystore {
        Keystore::new(self.private_pfx_path(node), self.password.as_str())
    }

    /// Create `private-<node>.pfx`.
    ///
    /// An existing container is never overwritten: the call returns its
    /// path unchanged. To regenerate, back the file up first. A failed
    /// generation removes the partial container.
    pub fn generate_private_pfx_keys(&self, node: &NodeAlias) -> Result<PathBuf> {
        let keystore = self.private_keystore(node);
        if keystore.exists() {
            info!(%node, path = %keystore.path().display(), "private container exists, skipping");
            return Ok(keystore.path().to_path_buf());
        }
        fs::create_dir_all(&self.key_dir).map_err(|e| KeyError::io(&self.key_dir, e))?;

        if let Err(e) = self.build_private(node, &keystore) {
            if keystore.exists() {
                if let Err(rm) = fs::remove_file(keystore.path()) {
                    warn!(%node, error = %rm, "failed to remove partial container");
                }
            }
            return Err(e);
        }

        info!(%node, path = %keystore.path().display(), "private container generated");
        Ok(keystore.path().to_path_buf())
    }

    fn build_private(&self, node: &NodeAlias, keystore: &Keystore) -> Result<()> {
        let tool = self.tool.as_ref();
        let signing_alias = PfxEntry::Signing.private_alias(node);

        for entry in PfxEntry::ALL {
            let alias = entry.private_alias(node);
            let common_name = entry.common_name(node);
            tool.generate_key_pair(
                keystore,
                &KeyPairSpec {
                    alias: &alias,
                    common_name: &common_name,
                    algorithm: entry.algorithm(),
                    validity_days: entry.validity_days(),
                },
            )?;

            if entry != PfxEntry::Signing {
                let csr = tool.cert_request(keystore, &alias)?;
                let signed = tool.sign_cert(keystore, &signing_alias, &csr, entry.validity_days())?;
                tool.import_cert(keystore, &alias, &signed)?;
            }
        }

        // The issued certificates must verify under the signing key before
        // the container is handed out.
        let signing = export_certificate(tool, keystore, &signing_alias)?;
        verify::verify_self_signed(&signing)?;
        for entry in [PfxEntry::Agreement, PfxEntry::Encryption] {
            let issued = export_certificate(tool, keystore, &entry.private_alias(node))?;
            verify::verify_issued_by(&issued, &signing)?;
        }
        Ok(())
    }

    /// Export `node`'s public certificates from its private container and
    /// import them into `public.pfx`, replacing only that node's aliases.
    pub fn update_public_pfx_key(&self, node: &NodeAlias) -> Result<()> {
        let keystore = self.private_keystore(node);
        if !keystore.exists() {
            return Err(KeyError::MissingKeyMaterial(keystore.path().to_path_buf()));
        }

        let certs = PfxEntry::ALL
            .iter()
            .map(|entry| {
                let pem = self.tool.export_cert(&keystore, &entry.private_alias(node))?;
                Ok((entry.public_alias(node), pem))
            })
            .collect::<Result<Vec<_>>>()?;

        self.public.replace_entries(self.tool.as_ref(), &certs)?;
        info!(%node, path = %self.public.path().display(), "public certificates updated");
        Ok(())
    }

    /// Drop `node`'s aliases from `public.pfx`.
    pub fn remove_public_pfx_key(&self, node: &NodeAlias) -> Result<()> {
        let aliases: Vec<String> = PfxEntry::ALL.iter().map(|e| e.public_alias(node)).collect();
        let removed = self.public.remove_entries(self.tool.as_ref(), &aliases)?;
        info!(%node, removed = removed.len(), "public certificates removed");
        Ok(())
    }

    /// Public certificate of `entry` for `node` from `public.pfx`.
    pub fn public_certificate(&self, node: &NodeAlias, entry: PfxEntry) -> Result<Certificate> {
        let keystore = Keystore::new(self.public.path(), self.password.as_str());
        export_certificate(self.tool.as_ref(), &keystore, &entry.public_alias(node))
    }

    /// Fingerprints of the `public.pfx` entries belonging to `nodes`, keyed
    /// by alias. Aliases absent from the container are left out.
    pub fn public_fingerprints(&self, nodes: &[NodeAlias]) -> Result<BTreeMap<String, Fingerprint>> {
        if !self.public.keystore.exists() {
            return Ok(BTreeMap::new());
        }
        let present = self.public.aliases(self.tool.as_ref())?;
        let mut out = BTreeMap::new();
        for node in nodes {
            for entry in PfxEntry::ALL {
                let alias = entry.public_alias(node);
                if present.contains(&alias) {
                    let cert = self.public_certificate(node, entry)?;
                    out.insert(alias, Fingerprint::of_bytes(cert.der()));
                }
            }
        }
        Ok(out)
    }
}

fn export_certificate(tool: &dyn KeyTool, keystore: &Keystore, alias: &str) -> Result<Certificate> {
    let pem_bytes = tool.export_cert(keystore, alias)?;
    let malformed = |message: String| KeyError::MalformedKey {
        path: keystore.path().to_path_buf(),
        message,
    };
    let text = std::str::from_utf8(&pem_bytes).map_err(|e| malformed(e.to_string()))?;
    let block = pem::parse(text).map_err(|e| malformed(e.to_string()))?;
    Certificate::from_der(block.contents())
}
