//! Key file format of a network.
//!
//! The format is chosen when the network is first deployed and never
//! changes. Migrating between formats is unsupported, so a request that
//! disagrees with the material already on disk is a conflict.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

/// How gossip keys are stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// `s-private-<node>.pem`, `a-public-<node>.pem`, ...
    Pem,
    /// `private-<node>.pfx` per node plus a shared `public.pfx`.
    Pkcs12,
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pem => "pem",
            Self::Pkcs12 => "pkcs12",
        })
    }
}

/// Inspect `directory` for existing gossip key material.
///
/// Returns `None` for an empty or missing directory. TLS files are present
/// in both formats and are ignored.
pub fn detect_key_format(directory: &Path) -> Result<Option<KeyFormat>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KeyError::io(directory, e)),
    };

    let mut pem = false;
    let mut pkcs12 = false;
    for entry in entries {
        let entry = entry.map_err(|e| KeyError::io(directory, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(".pfx") {
            pkcs12 = true;
        } else if name.ends_with(".pem")
            && (name.starts_with("s-private-") || name.starts_with("a-private-"))
        {
            pem = true;
        }
    }

    Ok(match (pem, pkcs12) {
        (false, false) => None,
        (true, false) => Some(KeyFormat::Pem),
        (false, true) => Some(KeyFormat::Pkcs12),
        // Both present means someone already mixed formats; report the
        // container format so any PEM request conflicts.
        (true, true) => Some(KeyFormat::Pkcs12),
    })
}

/// Fail with [`KeyError::KeyFormatConflict`] if `directory` already holds
/// key material in a format other than `requested`.
pub fn ensure_key_format(directory: &Path, requested: KeyFormat) -> Result<()> {
    match detect_key_format(directory)? {
        Some(existing) if existing != requested => Err(KeyError::KeyFormatConflict {
            existing,
            requested,
        }),
        _ => Ok(()),
    }
}
