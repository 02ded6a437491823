//! Deployment configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file) describes a single-realm PEM network in namespace `solo`.
//!
//! ```toml
//! namespace = "solo-e2e"
//! key_format = "pkcs12"
//! backup_retention = { keep-latest = 5 }
//!
//! [activation]
//! max_attempts = 60
//! interval_ms = 2000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use deploy_keys::{BackupRetention, KeyFormat};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Cluster namespace the network runs in.
    pub namespace: String,
    /// Local directory holding every node's key files.
    pub key_dir: PathBuf,
    /// Local directory for rendered files awaiting upload.
    pub staging_dir: PathBuf,
    /// Persisted node registry.
    pub registry_path: PathBuf,
    pub key_format: KeyFormat,
    pub pfx_password: String,
    pub realm: u64,
    pub shard: u64,
    /// Account number of the first node; later nodes count up from here.
    pub first_account: u64,
    pub gossip_internal_port: u16,
    pub gossip_external_port: u16,
    pub default_weight: u64,
    pub swirld_name: String,
    pub app_jar: String,
    pub chart_release: String,
    pub retry: RetryConfig,
    pub activation: ActivationConfig,
    /// Upper bound on concurrent per-node tasks within one step.
    pub max_concurrency: usize,
    pub backup_retention: BackupRetention,
    pub freeze_command: Vec<String>,
    pub restart_command: Vec<String>,
    pub remote: RemotePaths,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            namespace: "solo".into(),
            key_dir: PathBuf::from("keys"),
            staging_dir: PathBuf::from("staging"),
            registry_path: PathBuf::from("registry.toml"),
            key_format: KeyFormat::Pem,
            pfx_password: deploy_keys::pfx::DEFAULT_PFX_PASSWORD.into(),
            realm: 0,
            shard: 0,
            first_account: 3,
            gossip_internal_port: 50111,
            gossip_external_port: 50111,
            default_weight: 1,
            swirld_name: "123".into(),
            app_jar: "HederaNode.jar".into(),
            chart_release: "solo-deployment".into(),
            retry: RetryConfig::default(),
            activation: ActivationConfig::default(),
            max_concurrency: 4,
            backup_retention: BackupRetention::KeepAll,
            freeze_command: vec!["/opt/hgcapp/bin/freeze-network".into()],
            restart_command: vec!["systemctl".into(), "restart".into(), "network-node".into()],
            remote: RemotePaths::default(),
        }
    }
}

/// Retry budget for I/O-class steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Bounded health polling after restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            interval_ms: 1000,
        }
    }
}

impl ActivationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Paths inside the node containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePaths {
    pub keys_dir: String,
    pub tls_dir: String,
    pub config_path: String,
    pub owner: String,
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self {
            keys_dir: "/opt/hgcapp/services-hedera/HapiApp2.0/data/keys".into(),
            tls_dir: "/opt/hgcapp/services-hedera/HapiApp2.0".into(),
            config_path: "/opt/hgcapp/services-hedera/HapiApp2.0/config.txt".into(),
            owner: "hedera:hedera".into(),
        }
    }
}

impl DeployConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DeployError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DeployError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DeployError::Config(msg.to_string()));
        if self.namespace.is_empty() {
            return invalid("namespace must not be empty");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.activation.max_attempts == 0 {
            return invalid("activation.max_attempts must be at least 1");
        }
        if self.default_weight == 0 {
            return invalid("default_weight must be positive");
        }
        if self.restart_command.is_empty() || self.freeze_command.is_empty() {
            return invalid("freeze and restart commands must not be empty");
        }
        if matches!(self.backup_retention, BackupRetention::KeepLatest(0)) {
            return invalid("backup retention must keep at least one backup");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(DeployConfig::from_toml("").unwrap(), DeployConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = DeployConfig::from_toml(
            r#"
            namespace = "solo-e2e"
            key_format = "pkcs12"
            backup_retention = { keep-latest = 5 }

            [activation]
            max_attempts = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "solo-e2e");
        assert_eq!(config.key_format, KeyFormat::Pkcs12);
        assert_eq!(config.backup_retention, BackupRetention::KeepLatest(5));
        assert_eq!(config.activation.max_attempts, 60);
        assert_eq!(config.activation.interval_ms, 1000);
        assert_eq!(config.first_account, 3);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = DeployConfig::from_toml("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn serializes_back_to_toml() {
        let text = DeployConfig::default().to_toml().unwrap();
        assert_eq!(DeployConfig::from_toml(&text).unwrap(), DeployConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        fs::write(&path, "namespace = \"from-file\"\n").unwrap();
        assert_eq!(DeployConfig::from_file(&path).unwrap().namespace, "from-file");
    }
}
