//! Error types for the `deploy-keys` crate.
//!
//! Key generation and certificate verification failures are fatal: retrying
//! with the same inputs reproduces them. Only the caller (the lifecycle
//! orchestrator) decides whether an enclosing operation is re-run.

use std::path::PathBuf;

use thiserror::Error;

use crate::format::KeyFormat;

/// Errors that can occur within the `deploy-keys` crate.
#[derive(Debug, Error)]
pub enum KeyError {
    // --- Arguments ---
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid node alias '{alias}': {reason}")]
    InvalidNodeAlias { alias: String, reason: String },

    // --- Generation ---
    #[error("failed to generate {role} key pair: {message}")]
    KeyGeneration { role: &'static str, message: String },

    #[error("failed to issue {role} certificate: {message}")]
    CertificateGeneration { role: &'static str, message: String },

    // --- Verification ---
    #[error("certificate verification failed: {0}")]
    CertificateVerification(String),

    // --- Encoding ---
    #[error("malformed key material in {path}: {message}")]
    MalformedKey { path: PathBuf, message: String },

    #[error("key material not found: {0}")]
    MissingKeyMaterial(PathBuf),

    #[error("key format conflict: network uses {existing}, requested {requested}")]
    KeyFormatConflict {
        existing: KeyFormat,
        requested: KeyFormat,
    },

    // --- External key tooling ---
    #[error("key tool {operation} failed: {message}")]
    KeyTool {
        operation: &'static str,
        message: String,
    },

    // --- TLS ---
    #[error("TLS identity rejected: {0}")]
    TlsIdentity(String),

    // --- I/O ---
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl KeyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias using [`KeyError`].
pub type Result<T> = std::result::Result<T, KeyError>;
