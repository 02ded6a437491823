//! Shared services and per-operation state threaded through the steps.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deploy_keys::backup::KeyBackup;
use deploy_keys::fingerprint::{self, Snapshot};
use deploy_keys::{Fingerprint, KeyFormat, KeyManager, KeyRole, NodeAlias, PfxKeyManager};
use tracing::debug;

use super::{LifecycleOperation, OperationReport, UpdateOptions};
use crate::chart::ChartInstaller;
use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::pipeline::PipelineOutcome;
use crate::registry::NodeRegistry;
use crate::staging::{FileMode, RemoteStaging, StagingPlan};
use crate::topology::{NetworkTopology, TopologyRenderer};

/// Long-lived collaborators shared by every operation.
pub(crate) struct Services {
    pub(crate) config: DeployConfig,
    pub(crate) keys: KeyManager,
    pub(crate) pfx: PfxKeyManager,
    pub(crate) backup: KeyBackup,
    pub(crate) renderer: TopologyRenderer,
    pub(crate) staging: RemoteStaging,
    pub(crate) chart: Arc<dyn ChartInstaller>,
    pub(crate) clock: fn() -> i64,
}

impl Services {
    pub(crate) fn key_format(&self) -> KeyFormat {
        self.config.key_format
    }

    /// Local key files of `node`: gossip material and/or TLS files.
    pub(crate) fn key_files(&self, node: &NodeAlias, gossip: bool, tls: bool) -> Vec<PathBuf> {
        let dir = &self.config.key_dir;
        let mut files = Vec::new();
        if gossip {
            match self.key_format() {
                KeyFormat::Pem => files.extend(KeyManager::pem_key_paths(node, dir, &KeyRole::GOSSIP)),
                KeyFormat::Pkcs12 => files.push(self.pfx.private_pfx_path(node)),
            }
        }
        if tls {
            files.extend(KeyManager::pem_key_paths(node, dir, &[KeyRole::Tls]));
        }
        files
    }

    pub(crate) fn has_gossip_keys(&self, node: &NodeAlias) -> bool {
        match self.key_format() {
            KeyFormat::Pem => KeyRole::GOSSIP
                .iter()
                .all(|role| KeyManager::has_pem_key(node, &self.config.key_dir, *role)),
            KeyFormat::Pkcs12 => self.pfx.private_pfx_path(node).is_file(),
        }
    }

    pub(crate) fn has_tls_key(&self, node: &NodeAlias) -> bool {
        KeyManager::has_pem_key(node, &self.config.key_dir, KeyRole::Tls)
    }

    /// Generate and store `node`'s gossip and/or TLS keys. Files already at
    /// the target paths must have been moved aside first.
    pub(crate) fn generate_keys(&self, node: &NodeAlias, gossip: bool, tls: bool) -> Result<()> {
        let dir = &self.config.key_dir;
        if gossip {
            match self.key_format() {
                KeyFormat::Pem => {
                    self.keys.generate_gossip_pem_keys(node, dir)?;
                }
                KeyFormat::Pkcs12 => {
                    self.pfx.generate_private_pfx_keys(node)?;
                    self.pfx.update_public_pfx_key(node)?;
                }
            }
        }
        if tls {
            self.keys.generate_tls_pem_key(node, dir)?;
        }
        Ok(())
    }

    /// Move `node`'s files out of the way and drop its public container
    /// entries.
    pub(crate) fn retire_keys(&self, node: &NodeAlias) -> Result<Option<PathBuf>> {
        let moved = self.backup.backup_files(&self.key_files(node, true, true))?;
        if self.key_format() == KeyFormat::Pkcs12 {
            self.pfx.remove_public_pfx_key(node)?;
        }
        Ok(moved)
    }

    /// Put back files moved by [`Self::retire_keys`] or a pre-rotation
    /// backup, re-publishing the node's public certificates.
    pub(crate) fn restore_keys(&self, node: &NodeAlias, backup_dir: &Path) -> Result<()> {
        self.backup.restore(backup_dir)?;
        if self.key_format() == KeyFormat::Pkcs12 && self.pfx.private_pfx_path(node).is_file() {
            self.pfx.update_public_pfx_key(node)?;
        }
        Ok(())
    }

    pub(crate) fn guard(&self, nodes: &[NodeAlias]) -> Result<InterferenceGuard> {
        let paths: Vec<PathBuf> = nodes
            .iter()
            .flat_map(|n| self.key_files(n, true, true))
            .collect();
        let files = fingerprint::snapshot(&paths)?;
        let public = match self.key_format() {
            KeyFormat::Pem => BTreeMap::new(),
            KeyFormat::Pkcs12 => self.pfx.public_fingerprints(nodes)?,
        };
        debug!(nodes = nodes.len(), files = files.len(), entries = public.len(), "key snapshot taken");
        Ok(InterferenceGuard {
            nodes: nodes.to_vec(),
            files,
            public,
        })
    }

    /// Fail with [`DeployError::NonInterference`] if any file or public
    /// container entry captured by `guard` changed.
    pub(crate) fn check_guard(
        &self,
        guard: &InterferenceGuard,
        operation: LifecycleOperation,
        node: &NodeAlias,
    ) -> Result<()> {
        let now = self.guard(&guard.nodes)?;
        let mut changed = fingerprint::changed_paths(&guard.files, &now.files);

        let container = self.pfx.public_store().path();
        let moved: BTreeSet<&String> = guard
            .public
            .keys()
            .chain(now.public.keys())
            .filter(|alias| guard.public.get(*alias) != now.public.get(*alias))
            .collect();
        changed.extend(
            moved
                .into_iter()
                .map(|alias| PathBuf::from(format!("{}#{alias}", container.display()))),
        );

        if changed.is_empty() {
            debug!(%node, nodes = guard.nodes.len(), "untouched key material unchanged");
            return Ok(());
        }
        Err(DeployError::NonInterference {
            operation: operation.name(),
            node: node.clone(),
            paths: changed,
        })
    }

    pub(crate) fn now(&self) -> i64 {
        (self.clock)()
    }
}

/// Fingerprints of key material that an operation must leave alone.
pub(crate) struct InterferenceGuard {
    nodes: Vec<NodeAlias>,
    files: Snapshot,
    public: BTreeMap<String, Fingerprint>,
}

/// State of one running operation.
pub(crate) struct OperationContext {
    pub(crate) services: Arc<Services>,
    pub(crate) operation: LifecycleOperation,
    pub(crate) target: Option<NodeAlias>,
    /// Nodes whose own key material this operation writes or retires.
    pub(crate) targets: Vec<NodeAlias>,
    /// Working copy; persisted by the final step only.
    pub(crate) registry: NodeRegistry,
    pub(crate) update: UpdateOptions,
    /// Whether the targets' gossip/TLS material is pushed to the pods.
    pub(crate) stage_gossip: bool,
    pub(crate) stage_tls: bool,
    /// Targets whose key files this operation created from nothing.
    pub(crate) fresh: Vec<NodeAlias>,
    /// Backup directories made for the targets' replaced files.
    pub(crate) backups: Vec<PathBuf>,
    pub(crate) guard: Option<InterferenceGuard>,
    pub(crate) topology: Option<NetworkTopology>,
    pub(crate) config_txt: Option<PathBuf>,
}

impl OperationContext {
    pub(crate) fn new(
        services: Arc<Services>,
        operation: LifecycleOperation,
        target: Option<NodeAlias>,
        targets: Vec<NodeAlias>,
        registry: NodeRegistry,
    ) -> Self {
        Self {
            services,
            operation,
            target,
            targets,
            registry,
            update: UpdateOptions::default(),
            stage_gossip: false,
            stage_tls: false,
            fresh: Vec::new(),
            backups: Vec::new(),
            guard: None,
            topology: None,
            config_txt: None,
        }
    }

    pub(crate) fn label(&self) -> String {
        self.target
            .as_ref()
            .map_or_else(|| "network".to_string(), NodeAlias::to_string)
    }

    pub(crate) fn target(&self) -> Result<&NodeAlias> {
        self.target
            .as_ref()
            .ok_or(DeployError::MissingArgument("node alias"))
    }

    pub(crate) fn topology(&self) -> Result<&NetworkTopology> {
        self.topology
            .as_ref()
            .ok_or_else(|| DeployError::InvalidOperation("topology not rendered yet".into()))
    }

    /// Registered nodes this operation must not touch.
    pub(crate) fn untouched(&self) -> Vec<NodeAlias> {
        self.registry
            .aliases()
            .into_iter()
            .filter(|n| !self.targets.contains(n))
            .collect()
    }

    /// Nodes of the rendered topology: the ones that receive files and are
    /// restarted.
    pub(crate) fn recipients(&self) -> Vec<String> {
        self.topology
            .as_ref()
            .map(|t| t.aliases().iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Node the freeze command runs on: an already running node, preferring
    /// one other than the target.
    pub(crate) fn freeze_node(&self) -> Option<NodeAlias> {
        let aliases = self.topology.as_ref()?.aliases();
        let other = aliases
            .iter()
            .find(|n| Some(*n) != self.target.as_ref())
            .cloned();
        match self.operation {
            // A node being added is not running yet.
            LifecycleOperation::Add => other,
            _ => other.or_else(|| self.target.clone().filter(|t| aliases.contains(t))),
        }
    }

    /// Files `recipient` receives.
    ///
    /// Every node gets the address book and the targets' public material.
    /// Private keys only ever go to their own node.
    pub(crate) fn plan_for(&self, recipient: &NodeAlias) -> StagingPlan {
        let services = &self.services;
        let key_dir = &services.config.key_dir;
        let remote = services.staging.remote();
        let own = self.targets.contains(recipient);

        let mut plan = StagingPlan::default();
        if let Some(config_txt) = &self.config_txt {
            plan.push(config_txt, services.staging.config_dir(), FileMode::Public);
        }

        match services.key_format() {
            KeyFormat::Pem if self.stage_gossip => {
                for node in &self.targets {
                    for role in KeyRole::GOSSIP {
                        let names = role.file_names(node);
                        plan.push(key_dir.join(&names.certificate), &remote.keys_dir, FileMode::Public);
                        if node == recipient {
                            plan.push(key_dir.join(&names.private_key), &remote.keys_dir, FileMode::Private);
                        }
                    }
                }
                // A target with fresh gossip keys also needs every peer's
                // public certificates to verify them.
                if own {
                    for peer in self.untouched() {
                        for role in KeyRole::GOSSIP {
                            let names = role.file_names(&peer);
                            plan.push(key_dir.join(&names.certificate), &remote.keys_dir, FileMode::Public);
                        }
                    }
                }
            }
            KeyFormat::Pem => {}
            KeyFormat::Pkcs12 => {
                if self.stage_gossip || self.operation == LifecycleOperation::Delete {
                    plan.push(services.pfx.public_store().path(), &remote.keys_dir, FileMode::Public);
                }
                if self.stage_gossip && own {
                    plan.push(services.pfx.private_pfx_path(recipient), &remote.keys_dir, FileMode::Private);
                }
            }
        }

        if self.stage_tls && own {
            let names = KeyRole::Tls.file_names(recipient);
            plan.push(key_dir.join(&names.private_key), &remote.tls_dir, FileMode::Private);
            plan.push(key_dir.join(&names.certificate), &remote.tls_dir, FileMode::Public);
        }
        plan
    }

    pub(crate) fn into_report(self, outcome: PipelineOutcome) -> Result<OperationReport> {
        let topology = self
            .topology
            .ok_or_else(|| DeployError::InvalidOperation("operation finished without a topology".into()))?;
        Ok(OperationReport {
            operation: self.operation,
            node: self.target,
            completed_steps: outcome.completed,
            skipped_steps: outcome.skipped,
            topology,
        })
    }
}
