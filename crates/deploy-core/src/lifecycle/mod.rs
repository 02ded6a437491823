//! Node lifecycle orchestration.
//!
//! [`Orchestrator`] turns each lifecycle operation into a [`Pipeline`] of
//! named steps over an [`OperationContext`]: validate, generate or retire
//! the target's keys, prove untouched nodes' key files did not change,
//! render the topology, freeze, stage, restart, wait for activation, and
//! finally persist the node registry.
//!
//! Operations are serialized: one orchestrator runs at most one operation
//! at a time, so the shared `public.pfx` and the registry file only ever
//! have a single writer. The registry is written last, so an operation
//! that halts part-way can be re-run from the start.

mod add;
mod context;
mod delete;
mod deploy;
mod steps;
mod update;

use std::fmt;
use std::sync::Arc;

use deploy_keys::backup::KeyBackup;
use deploy_keys::{KeyManager, KeyTool, NodeAlias, PfxKeyManager};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};

use crate::chart::ChartInstaller;
use crate::cluster::PodAccess;
use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::pipeline::Pipeline;
use crate::registry::NodeRegistry;
use crate::staging::RemoteStaging;
use crate::topology::{NetworkTopology, TopologyRenderer};

use self::context::{OperationContext, Services};

/// Kind of lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOperation {
    Deploy,
    Add,
    Update,
    Delete,
}

impl LifecycleOperation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When an update regenerates the node's gRPC TLS key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsRotation {
    #[default]
    Never,
    Always,
    /// Only once the current certificate is past its rotation threshold
    /// or missing.
    WhenExpiring,
}

/// What an update changes on its target node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub tls: TlsRotation,
    /// Regenerate the signing and agreement keys.
    pub rotate_gossip: bool,
    /// New consensus weight.
    pub weight: Option<u64>,
}

/// Summary of a successful operation.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: LifecycleOperation,
    /// Target node; `None` for a deployment.
    pub node: Option<NodeAlias>,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub topology: NetworkTopology,
}

/// External capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn PodAccess>,
    pub chart: Arc<dyn ChartInstaller>,
    pub key_tool: Arc<dyn KeyTool>,
}

/// Runs lifecycle operations against one network.
pub struct Orchestrator {
    services: Arc<Services>,
    writer: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: DeployConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_clock(config, collaborators, system_now_epoch_secs)
    }

    /// Use a fixed clock (seconds since Unix epoch) for certificate
    /// validity and rotation decisions.
    pub fn with_clock(
        config: DeployConfig,
        collaborators: Collaborators,
        clock: fn() -> i64,
    ) -> Result<Self> {
        config.validate()?;

        let pfx = PfxKeyManager::new(
            collaborators.key_tool,
            config.key_dir.clone(),
            &config.pfx_password,
        );
        let services = Services {
            keys: KeyManager::with_clock(clock),
            pfx,
            backup: KeyBackup::new(&config.key_dir, config.backup_retention),
            renderer: TopologyRenderer::from_config(&config),
            staging: RemoteStaging::new(collaborators.cluster, &config.namespace, config.remote.clone()),
            chart: collaborators.chart,
            clock,
            config,
        };

        Ok(Self {
            services: Arc::new(services),
            writer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DeployConfig {
        &self.services.config
    }

    /// The persisted node registry.
    pub fn registry(&self) -> Result<NodeRegistry> {
        NodeRegistry::load(&self.services.config.registry_path)
    }

    /// Topology of the persisted registry.
    pub fn topology(&self) -> Result<NetworkTopology> {
        Ok(self.services.renderer.topology(&self.registry()?))
    }

    /// Deploy a new network of `names`.
    pub async fn deploy<S: AsRef<str>>(&self, names: &[S]) -> Result<OperationReport> {
        if names.is_empty() {
            return Err(DeployError::MissingArgument("node aliases"));
        }
        let nodes = NodeAlias::parse_list(names)?;

        let _writer = self.writer.lock().await;
        let ctx = self.context(LifecycleOperation::Deploy, None, nodes)?;
        let pipeline = deploy::pipeline(&self.services);
        self.execute(pipeline, ctx).await
    }

    /// Add `name` to the running network.
    pub async fn add_node(&self, name: &str) -> Result<OperationReport> {
        let node = parse_target(name)?;

        let _writer = self.writer.lock().await;
        let ctx = self.context(LifecycleOperation::Add, Some(node.clone()), vec![node])?;
        let pipeline = add::pipeline(&self.services);
        self.execute(pipeline, ctx).await
    }

    /// Reconfigure `name`, regenerating only its own keys as requested.
    pub async fn update_node(&self, name: &str, options: UpdateOptions) -> Result<OperationReport> {
        let node = parse_target(name)?;

        let _writer = self.writer.lock().await;
        let mut ctx = self.context(LifecycleOperation::Update, Some(node.clone()), vec![node])?;
        ctx.update = options;
        let pipeline = update::pipeline(&self.services);
        self.execute(pipeline, ctx).await
    }

    /// Remove `name` from the network.
    pub async fn delete_node(&self, name: &str) -> Result<OperationReport> {
        let node = parse_target(name)?;

        let _writer = self.writer.lock().await;
        let ctx = self.context(LifecycleOperation::Delete, Some(node.clone()), vec![node])?;
        let pipeline = delete::pipeline(&self.services);
        self.execute(pipeline, ctx).await
    }

    fn context(
        &self,
        operation: LifecycleOperation,
        target: Option<NodeAlias>,
        targets: Vec<NodeAlias>,
    ) -> Result<OperationContext> {
        let registry = self.registry()?;
        Ok(OperationContext::new(
            self.services.clone(),
            operation,
            target,
            targets,
            registry,
        ))
    }

    async fn execute(
        &self,
        pipeline: Pipeline<OperationContext>,
        mut ctx: OperationContext,
    ) -> Result<OperationReport> {
        let operation = ctx.operation;
        let node = ctx.label();
        let span = info_span!("lifecycle", %operation, node = %node);

        async {
            info!(steps = ?pipeline.step_names(), "operation started");
            let outcome = pipeline.run(&mut ctx).await?;
            info!("operation complete");
            ctx.into_report(outcome)
        }
        .instrument(span)
        .await
    }
}

fn parse_target(name: &str) -> Result<NodeAlias> {
    if name.trim().is_empty() {
        return Err(DeployError::MissingArgument("node alias"));
    }
    Ok(NodeAlias::parse(name)?)
}

fn system_now_epoch_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
