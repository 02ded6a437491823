//! Chart-installation capability.
//!
//! The network workload is installed and upgraded by an external chart
//! layer. The orchestrator supplies the node list derived from the topology
//! and nothing else.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use deploy_keys::NodeAlias;

use crate::cluster::MemoryCluster;
use crate::error::Result;
use crate::topology::NetworkTopology;

/// One node as the chart sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartNode {
    pub name: NodeAlias,
    pub account_id: String,
}

/// Values handed to the chart layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartValues {
    pub release: String,
    pub namespace: String,
    pub nodes: Vec<ChartNode>,
}

impl ChartValues {
    pub fn from_topology(release: &str, namespace: &str, topology: &NetworkTopology) -> Self {
        Self {
            release: release.to_string(),
            namespace: namespace.to_string(),
            nodes: topology
                .entries()
                .iter()
                .map(|e| ChartNode {
                    name: e.alias.clone(),
                    account_id: e.account.to_string(),
                })
                .collect(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[async_trait]
pub trait ChartInstaller: Send + Sync {
    async fn install(&self, values: &ChartValues) -> Result<()>;

    async fn upgrade(&self, values: &ChartValues) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartAction {
    Install,
    Upgrade,
}

/// [`ChartInstaller`] that records every call.
///
/// With a [`MemoryCluster`] attached it also reconciles the cluster's pods
/// to the node list, like a real release would.
#[derive(Default)]
pub struct RecordingChartInstaller {
    calls: Mutex<Vec<(ChartAction, ChartValues)>>,
    cluster: Option<Arc<MemoryCluster>>,
}

impl RecordingChartInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(cluster: Arc<MemoryCluster>) -> Self {
        Self {
            calls: Mutex::default(),
            cluster: Some(cluster),
        }
    }

    pub fn calls(&self) -> Vec<(ChartAction, ChartValues)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, action: ChartAction, values: &ChartValues) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, values.clone()));

        if let Some(cluster) = &self.cluster {
            let previous = cluster.pod_names();
            for node in &values.nodes {
                cluster.add_node_pods(&node.name);
            }
            for pod in previous {
                let released = values
                    .nodes
                    .iter()
                    .any(|n| pod.contains(&format!("-{}-", n.name)));
                if !released {
                    if let Some(alias) = pod
                        .strip_prefix("network-")
                        .and_then(|rest| rest.strip_suffix("-0"))
                        .and_then(|name| NodeAlias::parse(name).ok())
                    {
                        cluster.remove_node_pods(&alias);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChartInstaller for RecordingChartInstaller {
    async fn install(&self, values: &ChartValues) -> Result<()> {
        self.record(ChartAction::Install, values);
        Ok(())
    }

    async fn upgrade(&self, values: &ChartValues) -> Result<()> {
        self.record(ChartAction::Upgrade, values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::registry::NodeRegistry;
    use crate::topology::TopologyRenderer;

    fn topology(names: &[&str]) -> NetworkTopology {
        let mut registry = NodeRegistry::default();
        for name in names {
            registry.add(NodeAlias::parse(name).unwrap(), 1, 3).unwrap();
        }
        TopologyRenderer::from_config(&DeployConfig::default()).topology(&registry)
    }

    #[tokio::test]
    async fn upgrade_reconciles_pods() {
        let cluster = Arc::new(MemoryCluster::new("solo"));
        let chart = RecordingChartInstaller::with_cluster(cluster.clone());

        let values = ChartValues::from_topology("solo-deployment", "solo", &topology(&["node0", "node1"]));
        chart.install(&values).await.unwrap();
        assert_eq!(cluster.pod_names().len(), 4);

        let values = ChartValues::from_topology("solo-deployment", "solo", &topology(&["node0"]));
        chart.upgrade(&values).await.unwrap();
        assert_eq!(cluster.pod_names(), ["haproxy-node0-0", "network-node0-0"]);

        let calls = chart.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, ChartAction::Install);
        assert_eq!(calls[1].1.node_count(), 1);
        assert_eq!(calls[0].1.nodes[1].account_id, "0.0.4");
    }
}
