//! Error types for the `deploy-core` crate.
//!
//! Retry policy keys off [`DeployError::is_retryable`]: only transient
//! cluster I/O and remote staging failures are retried by the pipeline.
//! Validation, key and topology failures reproduce with the same inputs
//! and halt the operation immediately.

use std::fmt;
use std::path::PathBuf;

use deploy_keys::{KeyError, NodeAlias};
use thiserror::Error;

/// Failure reported by the cluster-access layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// I/O-class failure (connection reset, pod restarting, copy aborted).
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The cluster state itself forbids the request (pod gone, RBAC).
    #[error("terminal cluster error: {0}")]
    Terminal(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors that can occur within the `deploy-core` crate.
#[derive(Debug, Error)]
pub enum DeployError {
    // --- Preconditions ---
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    #[error("node {0} already exists")]
    NodeAlreadyExists(NodeAlias),

    #[error("node {0} not found")]
    NodeNotFound(NodeAlias),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // --- Key material ---
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("key files of untouched nodes changed during {operation} of {node}: {paths:?}")]
    NonInterference {
        operation: &'static str,
        node: NodeAlias,
        paths: Vec<PathBuf>,
    },

    // --- Cluster ---
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("staging {path} to {node} failed: {message}")]
    RemoteStaging {
        node: NodeAlias,
        path: String,
        message: String,
    },

    #[error("node {node} not active after {attempts} polls (last status: {last_status})")]
    NodeActivationTimeout {
        node: NodeAlias,
        attempts: u32,
        last_status: String,
    },

    #[error("chart operation failed: {0}")]
    Chart(String),

    // --- Local state ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry error at {path}: {message}")]
    Registry { path: PathBuf, message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // --- Pipeline ---
    #[error(transparent)]
    Pipeline(Box<PipelineError>),
}

impl DeployError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The underlying error when `self` wraps a halted pipeline.
    pub fn root_cause(&self) -> &DeployError {
        match self {
            Self::Pipeline(p) => p.source.root_cause(),
            other => other,
        }
    }

    /// Whether the pipeline may re-run the failing step.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cluster(e) => e.is_transient(),
            Self::RemoteStaging { .. } => true,
            _ => false,
        }
    }
}

impl From<PipelineError> for DeployError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(Box::new(e))
    }
}

/// A pipeline halted at a named step.
///
/// Carries enough progress information for an operator to re-run the
/// operation safely: which steps completed and, for a fan-out step, which
/// nodes had already been handled.
#[derive(Debug)]
pub struct PipelineError {
    pub step: String,
    pub node: Option<String>,
    pub attempts: u32,
    pub completed_steps: Vec<String>,
    pub updated_nodes: Vec<String>,
    pub source: DeployError,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed", self.step)?;
        if let Some(node) = &self.node {
            write!(f, " for {node}")?;
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.source)?;
        if !self.updated_nodes.is_empty() {
            write!(f, " (already updated: {})", self.updated_nodes.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Result type alias using [`DeployError`].
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_class_errors_retry() {
        assert!(DeployError::Cluster(ClusterError::Transient("reset".into())).is_retryable());
        assert!(!DeployError::Cluster(ClusterError::Terminal("gone".into())).is_retryable());
        assert!(DeployError::RemoteStaging {
            node: NodeAlias::parse("node0").unwrap(),
            path: "/tmp/config.txt".into(),
            message: "copy failed".into(),
        }
        .is_retryable());
        assert!(!DeployError::MissingArgument("node").is_retryable());
        assert!(!DeployError::Key(KeyError::CertificateVerification("bad".into())).is_retryable());
        assert!(!DeployError::NodeActivationTimeout {
            node: NodeAlias::parse("node3").unwrap(),
            attempts: 10,
            last_status: "STARTING_UP".into(),
        }
        .is_retryable());
    }

    #[test]
    fn pipeline_error_names_step_and_progress() {
        let err = PipelineError {
            step: "stage keys".into(),
            node: Some("node2".into()),
            attempts: 3,
            completed_steps: vec!["generate keys".into()],
            updated_nodes: vec!["node0".into(), "node1".into()],
            source: DeployError::Cluster(ClusterError::Transient("copy aborted".into())),
        };
        let text = err.to_string();
        assert!(text.contains("stage keys"));
        assert!(text.contains("node2"));
        assert!(text.contains("node0, node1"));
    }
}
