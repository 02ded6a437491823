//! Persistent record of the network's nodes.
//!
//! Each node gets a numeric id from a counter that only ever grows, and an
//! account number derived from that id when the node is first added. The
//! registry is the single source of truth for both, so removing or adding a
//! node never shifts another node's account.

use std::fs;
use std::path::Path;

use deploy_keys::NodeAlias;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeployError, Result};

/// One registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub alias: NodeAlias,
    pub node_id: u64,
    pub account_num: u64,
    pub weight: u64,
}

/// Registered nodes, ordered by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistry {
    next_node_id: u64,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

impl NodeRegistry {
    /// Load from `path`; a missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(DeployError::io(path, e)),
        };
        let mut registry: Self = toml::from_str(&text).map_err(|e| DeployError::Registry {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        registry.nodes.sort_by_key(|n| n.node_id);
        registry.check(path)?;
        Ok(registry)
    }

    /// Write to `path` through a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| DeployError::Registry {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| DeployError::io(parent, e))?;
        }
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text).map_err(|e| DeployError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| DeployError::io(path, e))?;
        debug!(path = %path.display(), nodes = self.nodes.len(), "registry saved");
        Ok(())
    }

    fn check(&self, path: &Path) -> Result<()> {
        let corrupt = |message: String| DeployError::Registry {
            path: path.to_path_buf(),
            message,
        };
        for (i, node) in self.nodes.iter().enumerate() {
            if node.node_id >= self.next_node_id {
                return Err(corrupt(format!(
                    "{} has id {} but next id is {}",
                    node.alias, node.node_id, self.next_node_id
                )));
            }
            if self.nodes[..i].iter().any(|n| n.alias == node.alias) {
                return Err(corrupt(format!("{} listed twice", node.alias)));
            }
        }
        Ok(())
    }

    /// Register `alias` with the next node id. Its account number is
    /// `first_account + node_id` and never changes afterwards.
    pub fn add(&mut self, alias: NodeAlias, weight: u64, first_account: u64) -> Result<&NodeRecord> {
        if self.contains(&alias) {
            return Err(DeployError::NodeAlreadyExists(alias));
        }
        let node_id = self.next_node_id;
        let account_num = first_account.checked_add(node_id).ok_or_else(|| {
            DeployError::Config(format!(
                "account number overflows: first account {first_account} + node id {node_id}"
            ))
        })?;
        self.next_node_id += 1;
        self.nodes.push(NodeRecord {
            alias,
            node_id,
            account_num,
            weight,
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    pub fn remove(&mut self, alias: &NodeAlias) -> Result<NodeRecord> {
        let index = self
            .nodes
            .iter()
            .position(|n| &n.alias == alias)
            .ok_or_else(|| DeployError::NodeNotFound(alias.clone()))?;
        Ok(self.nodes.remove(index))
    }

    pub fn set_weight(&mut self, alias: &NodeAlias, weight: u64) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| &n.alias == alias)
            .ok_or_else(|| DeployError::NodeNotFound(alias.clone()))?;
        node.weight = weight;
        Ok(())
    }

    pub fn get(&self, alias: &NodeAlias) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| &n.alias == alias)
    }

    pub fn contains(&self, alias: &NodeAlias) -> bool {
        self.get(alias).is_some()
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn aliases(&self) -> Vec<NodeAlias> {
        self.nodes.iter().map(|n| n.alias.clone()).collect()
    }

    pub fn next_node_id(&self) -> u64 {
        self.next_node_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(name: &str) -> NodeAlias {
        NodeAlias::parse(name).unwrap()
    }

    fn three_nodes() -> NodeRegistry {
        let mut registry = NodeRegistry::default();
        for name in ["node0", "node1", "node2"] {
            registry.add(alias(name), 1, 3).unwrap();
        }
        registry
    }

    #[test]
    fn accounts_follow_insertion_order() {
        let registry = three_nodes();
        let accounts: Vec<u64> = registry.nodes().iter().map(|n| n.account_num).collect();
        assert_eq!(accounts, [3, 4, 5]);
        assert_eq!(registry.next_node_id(), 3);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut registry = three_nodes();
        registry.remove(&alias("node1")).unwrap();
        let added = registry.add(alias("node3"), 1, 3).unwrap();
        assert_eq!(added.node_id, 3);
        assert_eq!(added.account_num, 6);
        assert_eq!(registry.get(&alias("node2")).unwrap().account_num, 5);
    }

    #[test]
    fn account_overflow_is_rejected() {
        let mut registry = NodeRegistry::default();
        registry.add(alias("node0"), 1, u64::MAX).unwrap();
        assert!(matches!(
            registry.add(alias("node1"), 1, u64::MAX),
            Err(DeployError::Config(_))
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.next_node_id(), 1);
    }

    #[test]
    fn duplicate_and_missing_nodes_are_rejected() {
        let mut registry = three_nodes();
        assert!(matches!(
            registry.add(alias("node0"), 1, 3),
            Err(DeployError::NodeAlreadyExists(_))
        ));
        assert!(matches!(
            registry.remove(&alias("node9")),
            Err(DeployError::NodeNotFound(_))
        ));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.toml");
        let mut registry = three_nodes();
        registry.remove(&alias("node0")).unwrap();
        registry.save(&path).unwrap();

        let loaded = NodeRegistry::load(&path).unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(loaded.next_node_id(), 3);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::load(&dir.path().join("registry.toml")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn corrupt_counter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.toml");
        fs::write(
            &path,
            r#"
next_node_id = 1

[[nodes]]
alias = "node4"
node_id = 4
account_num = 7
weight = 1
"#,
        )
        .unwrap();
        assert!(matches!(
            NodeRegistry::load(&path),
            Err(DeployError::Registry { .. })
        ));
    }
}
