//! SHA-256 fingerprints of key files and certificates.
//!
//! Fingerprints identify key material in logs and back the lifecycle
//! guarantee that an operation on one node leaves every other node's files
//! byte-identical: take a [`snapshot`] before, compare after.
//!
//! SHA-256 reference: `sha2` crate (RustCrypto, MIT/Apache-2.0)
//! Hex reference: `data-encoding` crate (MIT/Apache-2.0)

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

use crate::error::{KeyError, Result};

/// SHA-256 digest of a file or byte string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn of_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| KeyError::io(path, e))?;
        Ok(Self::of_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Fingerprints of a set of files, keyed by path.
pub type Snapshot = BTreeMap<PathBuf, Fingerprint>;

/// Fingerprint every path in `paths` that exists. Missing files are left
/// out, so a file appearing later shows up as a difference.
pub fn snapshot<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> Result<Snapshot> {
    let mut out = Snapshot::new();
    for path in paths {
        if path.is_file() {
            out.insert(path.clone(), Fingerprint::of_file(path)?);
        }
    }
    Ok(out)
}

/// Paths whose fingerprint differs between `before` and `after`, including
/// files that appeared or disappeared.
pub fn changed_paths(before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = before
        .iter()
        .filter(|(path, fp)| after.get(*path) != Some(fp))
        .map(|(path, _)| path.clone())
        .collect();
    changed.extend(
        after
            .keys()
            .filter(|path| !before.contains_key(*path))
            .cloned(),
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        let fp = Fingerprint::of_bytes(b"abc");
        assert_eq!(
            fp.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fp.short(), "ba7816bf");
    }

    #[test]
    fn snapshot_detects_modification_and_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pem");
        let b = dir.path().join("b.pem");
        fs::write(&a, "one").unwrap();

        let paths = vec![a.clone(), b.clone()];
        let before = snapshot(&paths).unwrap();
        assert_eq!(before.len(), 1);

        fs::write(&a, "two").unwrap();
        fs::write(&b, "new").unwrap();
        let after = snapshot(&paths).unwrap();

        let changed = changed_paths(&before, &after);
        assert_eq!(changed, vec![a, b]);
    }

    #[test]
    fn unchanged_files_produce_no_difference() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pem");
        fs::write(&a, "same").unwrap();
        let paths = vec![a];
        let before = snapshot(&paths).unwrap();
        let after = snapshot(&paths).unwrap();
        assert!(changed_paths(&before, &after).is_empty());
    }
}
