//! Cluster-access capability.
//!
//! The orchestrator never talks to the cluster API directly. Everything it
//! needs from running pods goes through [`PodAccess`]: file copies, command
//! execution, label lookups, port forwards and health probes.
//! [`MemoryCluster`] implements the capability in memory for tests.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use deploy_keys::NodeAlias;

use crate::error::ClusterError;

/// Label carrying a network pod's node alias.
pub const NODE_NAME_LABEL: &str = "solo.hedera.com/node-name";

/// Label distinguishing network pods from their proxies.
pub const POD_TYPE_LABEL: &str = "solo.hedera.com/type";

pub const NETWORK_NODE_TYPE: &str = "network-node";
pub const HAPROXY_TYPE: &str = "haproxy";

/// Platform status reported by a consensus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    StartingUp,
    Observing,
    Behind,
    Reconnecting,
    Active,
    Freezing,
    FreezeComplete,
    CatastrophicFailure,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StartingUp => "STARTING_UP",
            Self::Observing => "OBSERVING",
            Self::Behind => "BEHIND",
            Self::Reconnecting => "RECONNECT_COMPLETE",
            Self::Active => "ACTIVE",
            Self::Freezing => "FREEZING",
            Self::FreezeComplete => "FREEZE_COMPLETE",
            Self::CatastrophicFailure => "CATASTROPHIC_FAILURE",
        })
    }
}

/// Result of a command executed in a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open port forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub pod: String,
    pub local_port: u16,
    pub pod_port: u16,
}

/// Operations the orchestrator needs from the cluster.
///
/// Transient failures are reported as [`ClusterError::Transient`] and may be
/// retried; [`ClusterError::Terminal`] means the cluster state forbids the
/// request.
#[async_trait]
pub trait PodAccess: Send + Sync {
    /// Pod names in `namespace` whose labels include every `key=value` in
    /// `labels`, sorted.
    async fn list_pods_by_label(
        &self,
        namespace: &str,
        labels: &[(&str, &str)],
    ) -> Result<Vec<String>, ClusterError>;

    /// Copy a local file into `remote_dir` of `pod`, keeping its file name.
    async fn copy_to(
        &self,
        namespace: &str,
        pod: &str,
        local: &Path,
        remote_dir: &str,
    ) -> Result<(), ClusterError>;

    /// Copy `remote` from `pod` into `local_dir`. Returns the local path.
    async fn copy_from(
        &self,
        namespace: &str,
        pod: &str,
        remote: &str,
        local_dir: &Path,
    ) -> Result<PathBuf, ClusterError>;

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError>;

    /// Forward `local_port` (0 picks a free port) to `pod_port`.
    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        pod_port: u16,
    ) -> Result<PortForward, ClusterError>;

    async fn close_port_forward(&self, forward: &PortForward) -> Result<(), ClusterError>;

    /// Platform status of the consensus node in `pod`, read through the
    /// open `forward`.
    async fn node_status(
        &self,
        namespace: &str,
        forward: &PortForward,
    ) -> Result<NodeStatus, ClusterError>;

    /// Readiness probe result of `pod`.
    async fn is_ready(&self, namespace: &str, pod: &str) -> Result<bool, ClusterError>;
}

/// Name of the network pod running `node`.
pub fn network_pod_name(node: &NodeAlias) -> String {
    format!("network-{node}-0")
}

/// Name of the proxy pod in front of `node`.
pub fn haproxy_pod_name(node: &NodeAlias) -> String {
    format!("haproxy-{node}-0")
}

/// Operation selector for injected [`MemoryCluster`] failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOp {
    CopyTo,
    CopyFrom,
    Exec,
    PortForward,
    NodeStatus,
    IsReady,
}

#[derive(Debug, Default)]
struct MemoryPod {
    labels: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    exec_log: Vec<Vec<String>>,
    /// Statuses returned in order; the last one repeats.
    statuses: VecDeque<NodeStatus>,
    ready: bool,
}

#[derive(Debug)]
struct InjectedFailure {
    op: ClusterOp,
    pod: Option<String>,
    error: ClusterError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    pods: BTreeMap<String, MemoryPod>,
    failures: Vec<InjectedFailure>,
    forwards: Vec<PortForward>,
    next_local_port: u16,
}

/// In-memory [`PodAccess`] for a single namespace.
///
/// Pods are created with [`MemoryCluster::add_node_pods`], which models a
/// chart install: one network pod and one proxy pod per node. Network pods
/// report [`NodeStatus::Active`] unless a status sequence is scripted.
#[derive(Debug)]
pub struct MemoryCluster {
    namespace: String,
    state: Mutex<MemoryState>,
}

impl MemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Mutex::new(MemoryState {
                next_local_port: 30000,
                ..MemoryState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the network and proxy pods of `node` if they are missing.
    pub fn add_node_pods(&self, node: &NodeAlias) {
        let mut state = self.lock();
        state
            .pods
            .entry(network_pod_name(node))
            .or_insert_with(|| MemoryPod {
                labels: BTreeMap::from([
                    (NODE_NAME_LABEL.to_string(), node.to_string()),
                    (POD_TYPE_LABEL.to_string(), NETWORK_NODE_TYPE.to_string()),
                ]),
                statuses: VecDeque::from([NodeStatus::Active]),
                ready: true,
                ..MemoryPod::default()
            });
        state
            .pods
            .entry(haproxy_pod_name(node))
            .or_insert_with(|| MemoryPod {
                labels: BTreeMap::from([
                    (NODE_NAME_LABEL.to_string(), node.to_string()),
                    (POD_TYPE_LABEL.to_string(), HAPROXY_TYPE.to_string()),
                ]),
                ready: true,
                ..MemoryPod::default()
            });
    }

    /// Delete the pods of `node`.
    pub fn remove_node_pods(&self, node: &NodeAlias) {
        let mut state = self.lock();
        state.pods.remove(&network_pod_name(node));
        state.pods.remove(&haproxy_pod_name(node));
    }

    /// Statuses the network pod of `node` reports from now on, in order.
    pub fn script_status(&self, node: &NodeAlias, statuses: impl IntoIterator<Item = NodeStatus>) {
        if let Some(pod) = self.lock().pods.get_mut(&network_pod_name(node)) {
            pod.statuses = statuses.into_iter().collect();
        }
    }

    pub fn set_ready(&self, pod: &str, ready: bool) {
        if let Some(pod) = self.lock().pods.get_mut(pod) {
            pod.ready = ready;
        }
    }

    /// Fail the next `times` calls of `op` (on `pod`, or any pod).
    pub fn inject_failure(&self, op: ClusterOp, pod: Option<&str>, error: ClusterError, times: u32) {
        self.lock().failures.push(InjectedFailure {
            op,
            pod: pod.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().cloned().collect()
    }

    /// Contents of `remote` in `pod`.
    pub fn file(&self, pod: &str, remote: &str) -> Option<Vec<u8>> {
        self.lock().pods.get(pod)?.files.get(remote).cloned()
    }

    /// Remote paths present in `pod`.
    pub fn files(&self, pod: &str) -> Vec<String> {
        self.lock()
            .pods
            .get(pod)
            .map(|p| p.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Commands executed in `pod`, oldest first.
    pub fn exec_log(&self, pod: &str) -> Vec<Vec<String>> {
        self.lock()
            .pods
            .get(pod)
            .map(|p| p.exec_log.clone())
            .unwrap_or_default()
    }

    pub fn open_forwards(&self) -> usize {
        self.lock().forwards.len()
    }

    fn check(&self, state: &mut MemoryState, namespace: &str, op: ClusterOp, pod: &str) -> Result<(), ClusterError> {
        if namespace != self.namespace {
            return Err(ClusterError::Terminal(format!("namespace {namespace} not found")));
        }
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0 && f.pod.as_deref().map_or(true, |p| p == pod))
        {
            failure.remaining -= 1;
            return Err(failure.error.clone());
        }
        if !state.pods.contains_key(pod) {
            return Err(ClusterError::Terminal(format!("pod {pod} not found")));
        }
        Ok(())
    }
}

fn pod_mut<'a>(state: &'a mut MemoryState, pod: &str) -> Result<&'a mut MemoryPod, ClusterError> {
    state
        .pods
        .get_mut(pod)
        .ok_or_else(|| ClusterError::Terminal(format!("pod {pod} not found")))
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

#[async_trait]
impl PodAccess for MemoryCluster {
    async fn list_pods_by_label(
        &self,
        namespace: &str,
        labels: &[(&str, &str)],
    ) -> Result<Vec<String>, ClusterError> {
        if namespace != self.namespace {
            return Err(ClusterError::Terminal(format!("namespace {namespace} not found")));
        }
        let state = self.lock();
        Ok(state
            .pods
            .iter()
            .filter(|(_, pod)| {
                labels
                    .iter()
                    .all(|(k, v)| pod.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn copy_to(
        &self,
        namespace: &str,
        pod: &str,
        local: &Path,
        remote_dir: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::CopyTo, pod)?;
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClusterError::Terminal(format!("no file name in {}", local.display())))?;
        let bytes = fs::read(local)
            .map_err(|e| ClusterError::Transient(format!("read {}: {e}", local.display())))?;
        pod_mut(&mut state, pod)?
            .files
            .insert(join_remote(remote_dir, name), bytes);
        Ok(())
    }

    async fn copy_from(
        &self,
        namespace: &str,
        pod: &str,
        remote: &str,
        local_dir: &Path,
    ) -> Result<PathBuf, ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::CopyFrom, pod)?;
        let bytes = pod_mut(&mut state, pod)?
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| ClusterError::Terminal(format!("{remote} not found in {pod}")))?;
        let name = remote.rsplit('/').next().unwrap_or(remote);
        fs::create_dir_all(local_dir)
            .map_err(|e| ClusterError::Transient(format!("create {}: {e}", local_dir.display())))?;
        let local = local_dir.join(name);
        fs::write(&local, bytes)
            .map_err(|e| ClusterError::Transient(format!("write {}: {e}", local.display())))?;
        Ok(local)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::Exec, pod)?;
        pod_mut(&mut state, pod)?.exec_log.push(command.to_vec());
        Ok(ExecOutput::default())
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        pod_port: u16,
    ) -> Result<PortForward, ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::PortForward, pod)?;
        let local_port = if local_port == 0 {
            state.next_local_port += 1;
            state.next_local_port
        } else {
            local_port
        };
        let forward = PortForward {
            pod: pod.to_string(),
            local_port,
            pod_port,
        };
        state.forwards.push(forward.clone());
        Ok(forward)
    }

    async fn close_port_forward(&self, forward: &PortForward) -> Result<(), ClusterError> {
        self.lock().forwards.retain(|f| f != forward);
        Ok(())
    }

    async fn node_status(
        &self,
        namespace: &str,
        forward: &PortForward,
    ) -> Result<NodeStatus, ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::NodeStatus, &forward.pod)?;
        if !state.forwards.contains(forward) {
            return Err(ClusterError::Transient(format!(
                "no port forward to {}:{}",
                forward.pod, forward.pod_port
            )));
        }
        let pod = pod_mut(&mut state, &forward.pod)?;
        let status = if pod.statuses.len() > 1 {
            pod.statuses.pop_front()
        } else {
            pod.statuses.front().copied()
        };
        status.ok_or_else(|| ClusterError::Transient(format!("{} reports no status", forward.pod)))
    }

    async fn is_ready(&self, namespace: &str, pod: &str) -> Result<bool, ClusterError> {
        let mut state = self.lock();
        self.check(&mut state, namespace, ClusterOp::IsReady, pod)?;
        Ok(pod_mut(&mut state, pod)?.ready)
    }
}
