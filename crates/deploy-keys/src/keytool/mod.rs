//! Capability interface over the external key-tooling process.
//!
//! PKCS#12 containers are produced by discrete keystore operations: create a
//! key pair, emit a certificate signing request, sign it, import or export a
//! certificate, delete an entry. [`KeyTool`] abstracts those operations so
//! the container logic in [`crate::pfx`] runs unchanged against the real
//! `keytool` binary ([`ProcessKeyTool`]) or an in-process fake
//! ([`MemoryKeyTool`]).
//!
//! Every operation is synchronous; a failure is fatal for the enclosing key
//! operation and is never retried here.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::identity::KeyAlgorithm;

pub mod memory;
pub mod process;

pub use memory::MemoryKeyTool;
pub use process::ProcessKeyTool;

/// A password-protected PKCS#12 keystore on disk.
#[derive(Clone)]
pub struct Keystore {
    path: PathBuf,
    password: String,
}

impl Keystore {
    pub fn new(path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            password: password.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Parameters for a new key pair entry.
#[derive(Debug, Clone)]
pub struct KeyPairSpec<'a> {
    pub alias: &'a str,
    pub common_name: &'a str,
    pub algorithm: KeyAlgorithm,
    pub validity_days: i64,
}

/// Discrete keystore operations.
///
/// Certificates and requests cross the interface PEM-encoded.
pub trait KeyTool: Send + Sync {
    /// Create a key pair entry with a self-signed certificate.
    fn generate_key_pair(&self, keystore: &Keystore, spec: &KeyPairSpec<'_>) -> Result<()>;

    /// Produce a PKCS#10 request for the key pair stored under `alias`.
    fn cert_request(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>>;

    /// Sign `csr` with the key pair stored under `issuer_alias`.
    fn sign_cert(
        &self,
        keystore: &Keystore,
        issuer_alias: &str,
        csr: &[u8],
        validity_days: i64,
    ) -> Result<Vec<u8>>;

    /// Import a certificate under `alias` without prompting. For a key pair
    /// entry this installs a certificate reply; otherwise it adds a trusted
    /// certificate entry.
    fn import_cert(&self, keystore: &Keystore, alias: &str, cert: &[u8]) -> Result<()>;

    /// Export the certificate stored under `alias`.
    fn export_cert(&self, keystore: &Keystore, alias: &str) -> Result<Vec<u8>>;

    /// Remove the entry stored under `alias`.
    fn delete_entry(&self, keystore: &Keystore, alias: &str) -> Result<()>;

    /// Aliases present in the keystore. Empty if the file does not exist.
    fn list_aliases(&self, keystore: &Keystore) -> Result<Vec<String>>;
}
