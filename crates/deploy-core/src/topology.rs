//! Network topology and the `config.txt` address book.
//!
//! [`TopologyRenderer`] is a pure function of the node registry: the same
//! registry always renders byte-identical output. Entries are ordered by
//! node id, and account numbers come from the registry, so a node's line
//! only changes when that node itself changes.

use std::fmt;
use std::fs;
use std::path::Path;

use deploy_keys::NodeAlias;

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::registry::NodeRegistry;

/// File name of the rendered address book.
pub const CONFIG_TXT: &str = "config.txt";

/// `shard.realm.num` account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// One node's line in the address book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEntry {
    pub alias: NodeAlias,
    pub node_id: u64,
    pub account: AccountId,
    pub weight: u64,
    pub internal: Endpoint,
    pub external: Endpoint,
}

/// Rendered network topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    swirld_name: String,
    app_jar: String,
    next_node_id: u64,
    entries: Vec<TopologyEntry>,
}

impl NetworkTopology {
    pub fn entries(&self) -> &[TopologyEntry] {
        &self.entries
    }

    pub fn entry(&self, alias: &NodeAlias) -> Option<&TopologyEntry> {
        self.entries.iter().find(|e| &e.alias == alias)
    }

    pub fn account_of(&self, alias: &NodeAlias) -> Option<AccountId> {
        self.entry(alias).map(|e| e.account)
    }

    pub fn aliases(&self) -> Vec<NodeAlias> {
        self.entries.iter().map(|e| e.alias.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the address book text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("swirld, {}\n", self.swirld_name));
        out.push_str(&format!("app, {}\n", self.app_jar));
        for e in &self.entries {
            out.push_str(&format!(
                "address, {id}, {id}, {alias}, {weight}, {ihost}, {iport}, {ehost}, {eport}, {account}\n",
                id = e.node_id,
                alias = e.alias,
                weight = e.weight,
                ihost = e.internal.host,
                iport = e.internal.port,
                ehost = e.external.host,
                eport = e.external.port,
                account = e.account,
            ));
        }
        out.push_str(&format!("nextNodeId, {}\n", self.next_node_id));
        out
    }

    /// Write the rendered address book to `dir/config.txt`.
    pub fn write_to(&self, dir: &Path) -> Result<std::path::PathBuf> {
        fs::create_dir_all(dir).map_err(|e| DeployError::io(dir, e))?;
        let path = dir.join(CONFIG_TXT);
        fs::write(&path, self.render()).map_err(|e| DeployError::io(&path, e))?;
        Ok(path)
    }
}

/// Derives [`NetworkTopology`] from a [`NodeRegistry`].
#[derive(Debug, Clone)]
pub struct TopologyRenderer {
    namespace: String,
    shard: u64,
    realm: u64,
    internal_port: u16,
    external_port: u16,
    swirld_name: String,
    app_jar: String,
}

impl TopologyRenderer {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            shard: config.shard,
            realm: config.realm,
            internal_port: config.gossip_internal_port,
            external_port: config.gossip_external_port,
            swirld_name: config.swirld_name.clone(),
            app_jar: config.app_jar.clone(),
        }
    }

    /// Cluster-internal gossip host of `node`.
    pub fn internal_host(&self, node: &NodeAlias) -> String {
        format!("network-{node}-0.network-{node}-svc.{}.svc", self.namespace)
    }

    /// Gossip host other clusters reach `node` through.
    pub fn external_host(&self, node: &NodeAlias) -> String {
        format!("haproxy-{node}-svc.{}.svc", self.namespace)
    }

    pub fn topology(&self, registry: &NodeRegistry) -> NetworkTopology {
        let entries = registry
            .nodes()
            .iter()
            .map(|node| TopologyEntry {
                alias: node.alias.clone(),
                node_id: node.node_id,
                account: AccountId {
                    shard: self.shard,
                    realm: self.realm,
                    num: node.account_num,
                },
                weight: node.weight,
                internal: Endpoint {
                    host: self.internal_host(&node.alias),
                    port: self.internal_port,
                },
                external: Endpoint {
                    host: self.external_host(&node.alias),
                    port: self.external_port,
                },
            })
            .collect();

        NetworkTopology {
            swirld_name: self.swirld_name.clone(),
            app_jar: self.app_jar.clone(),
            next_node_id: registry.next_node_id(),
            entries,
        }
    }
}
