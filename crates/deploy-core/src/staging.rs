//! Remote staging: moving rendered files and key material into node pods.
//!
//! A [`StagingPlan`] lists the files one node receives. [`RemoteStaging`]
//! resolves the node's pod by label, copies each file, fixes ownership and
//! mode, and runs lifecycle commands. Transient cluster failures surface as
//! [`DeployError::RemoteStaging`] so the pipeline retries them; terminal
//! ones pass through unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deploy_keys::NodeAlias;
use tracing::{debug, info, warn};

use crate::cluster::{
    haproxy_pod_name, ExecOutput, NodeStatus, PodAccess, NETWORK_NODE_TYPE, NODE_NAME_LABEL,
    POD_TYPE_LABEL,
};
use crate::config::{ActivationConfig, RemotePaths};
use crate::error::{ClusterError, DeployError, Result};

/// Port the consensus node exposes its platform status on.
pub const METRICS_PORT: u16 = 9999;

/// File mode of staged files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Readable by the node user only (private keys).
    Private,
    Public,
}

impl FileMode {
    fn octal(self) -> &'static str {
        match self {
            Self::Private => "600",
            Self::Public => "644",
        }
    }
}

/// One file to place in a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub local: PathBuf,
    pub remote_dir: String,
    pub mode: FileMode,
}

/// Everything one node receives in a staging step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingPlan {
    pub files: Vec<StagedFile>,
}

impl StagingPlan {
    pub fn push(&mut self, local: impl Into<PathBuf>, remote_dir: &str, mode: FileMode) {
        self.files.push(StagedFile {
            local: local.into(),
            remote_dir: remote_dir.to_string(),
            mode,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Cluster-side half of a lifecycle operation.
#[derive(Clone)]
pub struct RemoteStaging {
    cluster: Arc<dyn PodAccess>,
    namespace: String,
    remote: RemotePaths,
}

impl RemoteStaging {
    pub fn new(cluster: Arc<dyn PodAccess>, namespace: &str, remote: RemotePaths) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            remote,
        }
    }

    pub fn remote(&self) -> &RemotePaths {
        &self.remote
    }

    /// Directory of the remote `config.txt`.
    pub fn config_dir(&self) -> &str {
        self.remote
            .config_path
            .rsplit_once('/')
            .map_or("/", |(dir, _)| dir)
    }

    /// The network pod running `node`.
    pub async fn resolve_pod(&self, node: &NodeAlias) -> Result<String> {
        let pods = self
            .cluster
            .list_pods_by_label(
                &self.namespace,
                &[
                    (NODE_NAME_LABEL, node.as_str()),
                    (POD_TYPE_LABEL, NETWORK_NODE_TYPE),
                ],
            )
            .await
            .map_err(|e| self.staging_error(node, "pod lookup", e))?;
        pods.into_iter().next().ok_or_else(|| {
            DeployError::Cluster(ClusterError::Terminal(format!("no network pod for {node}")))
        })
    }

    /// Copy every file of `plan` into `node`'s pod.
    pub async fn apply(&self, node: &NodeAlias, plan: &StagingPlan) -> Result<()> {
        let pod = self.resolve_pod(node).await?;
        for file in &plan.files {
            self.stage_file(node, &pod, file).await?;
        }
        info!(%node, files = plan.files.len(), "staged files");
        Ok(())
    }

    async fn stage_file(&self, node: &NodeAlias, pod: &str, file: &StagedFile) -> Result<()> {
        let name = file
            .local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeployError::InvalidOperation(format!("bad path {}", file.local.display())))?;
        let remote_path = format!("{}/{name}", file.remote_dir.trim_end_matches('/'));

        self.cluster
            .exec(&self.namespace, pod, &["mkdir".into(), "-p".into(), file.remote_dir.clone()])
            .await
            .map_err(|e| self.staging_error(node, &remote_path, e))?;
        self.cluster
            .copy_to(&self.namespace, pod, &file.local, &file.remote_dir)
            .await
            .map_err(|e| self.staging_error(node, &remote_path, e))?;
        self.run(node, pod, &["chown".into(), self.remote.owner.clone(), remote_path.clone()])
            .await?;
        self.run(node, pod, &["chmod".into(), file.mode.octal().into(), remote_path.clone()])
            .await?;

        debug!(%node, path = %remote_path, "staged file");
        Ok(())
    }

    /// Execute `command` in `node`'s pod. A non-zero exit is a staging
    /// failure.
    pub async fn exec(&self, node: &NodeAlias, command: &[String]) -> Result<ExecOutput> {
        let pod = self.resolve_pod(node).await?;
        self.run(node, &pod, command).await
    }

    async fn run(&self, node: &NodeAlias, pod: &str, command: &[String]) -> Result<ExecOutput> {
        let joined = command.join(" ");
        let output = self
            .cluster
            .exec(&self.namespace, pod, command)
            .await
            .map_err(|e| self.staging_error(node, &joined, e))?;
        if !output.success() {
            return Err(DeployError::RemoteStaging {
                node: node.clone(),
                path: joined,
                message: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            });
        }
        Ok(output)
    }

    /// Copy `remote` out of `node`'s pod into `local_dir`.
    pub async fn fetch(&self, node: &NodeAlias, remote: &str, local_dir: &Path) -> Result<PathBuf> {
        let pod = self.resolve_pod(node).await?;
        self.cluster
            .copy_from(&self.namespace, &pod, remote, local_dir)
            .await
            .map_err(|e| self.staging_error(node, remote, e))
    }

    /// Poll `node` until it reports [`NodeStatus::Active`] and its proxy is
    /// ready, at most `policy.max_attempts` polls each.
    pub async fn await_active(&self, node: &NodeAlias, policy: &ActivationConfig) -> Result<()> {
        let pod = self.resolve_pod(node).await?;
        let forward = self
            .cluster
            .port_forward(&self.namespace, &pod, 0, METRICS_PORT)
            .await
            .map_err(|e| self.staging_error(node, "port-forward", e))?;

        let polled = self.poll_status(node, &forward, policy).await;
        if let Err(e) = self.cluster.close_port_forward(&forward).await {
            warn!(%node, error = %e, "failed to close port forward");
        }
        polled?;

        self.await_proxy(node, policy).await?;
        info!(%node, "node active");
        Ok(())
    }

    async fn poll_status(
        &self,
        node: &NodeAlias,
        forward: &crate::cluster::PortForward,
        policy: &ActivationConfig,
    ) -> Result<()> {
        let mut last_status = String::from("unknown");
        for attempt in 1..=policy.max_attempts {
            match self.cluster.node_status(&self.namespace, forward).await {
                Ok(NodeStatus::Active) => return Ok(()),
                Ok(status) => last_status = status.to_string(),
                Err(e) if e.is_transient() => last_status = e.to_string(),
                Err(e) => return Err(e.into()),
            }
            debug!(%node, attempt, status = %last_status, "waiting for node");
            if attempt < policy.max_attempts {
                sleep(policy.interval()).await;
            }
        }
        Err(DeployError::NodeActivationTimeout {
            node: node.clone(),
            attempts: policy.max_attempts,
            last_status,
        })
    }

    async fn await_proxy(&self, node: &NodeAlias, policy: &ActivationConfig) -> Result<()> {
        let proxy = haproxy_pod_name(node);
        for attempt in 1..=policy.max_attempts {
            match self.cluster.is_ready(&self.namespace, &proxy).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }
            debug!(%node, attempt, pod = %proxy, "waiting for proxy");
            if attempt < policy.max_attempts {
                sleep(policy.interval()).await;
            }
        }
        Err(DeployError::NodeActivationTimeout {
            node: node.clone(),
            attempts: policy.max_attempts,
            last_status: format!("{proxy} not ready"),
        })
    }

    fn staging_error(&self, node: &NodeAlias, path: &str, e: ClusterError) -> DeployError {
        match e {
            ClusterError::Transient(message) => DeployError::RemoteStaging {
                node: node.clone(),
                path: path.to_string(),
                message,
            },
            terminal @ ClusterError::Terminal(_) => DeployError::Cluster(terminal),
        }
    }
}

async fn sleep(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
