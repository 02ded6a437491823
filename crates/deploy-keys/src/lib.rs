//! Key material for consensus network nodes.
//!
//! Certificate authority used by `deploy-core` when nodes are deployed,
//! added, updated or removed:
//!
//! - Signing, agreement and gRPC TLS key pairs per node ([`KeyManager`])
//! - PEM file storage and chain-verified loading
//! - PKCS#12 containers through a key-tooling capability ([`PfxKeyManager`])
//! - Dated key backups with an explicit retention policy
//! - SHA-256 fingerprints for before/after comparisons of key files

pub mod authority;
pub mod backup;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod identity;
pub mod keytool;
pub mod pfx;
pub mod tls;
pub mod verify;

pub use authority::KeyManager;
pub use backup::{BackupRetention, KeyBackup};
pub use error::KeyError;
pub use fingerprint::Fingerprint;
pub use format::KeyFormat;
pub use identity::{Certificate, KeyAlgorithm, KeyFileNames, KeyRole, NodeAlias, NodeKey};
pub use keytool::{KeyTool, Keystore, MemoryKeyTool, ProcessKeyTool};
pub use pfx::{PfxEntry, PfxKeyManager, PublicCertificateStore};
