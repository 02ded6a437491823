//! Steps shared by the lifecycle pipelines.

use deploy_keys::format::ensure_key_format;
use deploy_keys::NodeAlias;
use tracing::{info, warn};

use super::context::{OperationContext, Services};
use super::LifecycleOperation;
use crate::chart::{ChartAction, ChartValues};
use crate::error::{DeployError, Result};
use crate::pipeline::{RetryPolicy, Step};
use crate::topology::CONFIG_TXT;

type Ctx = OperationContext;

fn retry(services: &Services) -> RetryPolicy {
    RetryPolicy::from(&services.config.retry)
}

/// Reject a key format that disagrees with the material already on disk.
pub(super) fn check_key_format(ctx: &Ctx) -> Result<()> {
    let config = &ctx.services.config;
    ensure_key_format(&config.key_dir, config.key_format)?;
    Ok(())
}

pub(super) fn snapshot_untouched() -> Step<Ctx> {
    Step::new("snapshot untouched keys", |ctx: &mut Ctx| {
        Box::pin(async move {
            let untouched = ctx.untouched();
            ctx.guard = Some(ctx.services.guard(&untouched)?);
            Ok(())
        })
    })
}

pub(super) fn verify_untouched() -> Step<Ctx> {
    Step::new("verify untouched keys", |ctx: &mut Ctx| {
        Box::pin(async move {
            let node = ctx.target()?;
            match &ctx.guard {
                Some(guard) => ctx.services.check_guard(guard, ctx.operation, node),
                None => Err(DeployError::InvalidOperation("no key snapshot taken".into())),
            }
        })
    })
}

/// Move key files created by this operation into a backup directory.
pub(super) async fn retire_fresh_keys(ctx: &mut Ctx) -> Result<()> {
    for node in std::mem::take(&mut ctx.fresh) {
        if let Some(dir) = ctx.services.retire_keys(&node)? {
            info!(%node, backup = %dir.display(), "retired keys of failed operation");
        }
    }
    Ok(())
}

/// Put back the files backed up before this operation replaced or retired
/// them.
pub(super) async fn restore_backups(ctx: &mut Ctx) -> Result<()> {
    let node = ctx.target()?.clone();
    for dir in std::mem::take(&mut ctx.backups).iter().rev() {
        ctx.services.restore_keys(&node, dir)?;
    }
    Ok(())
}

pub(super) fn render_topology() -> Step<Ctx> {
    Step::new("render topology", |ctx: &mut Ctx| {
        Box::pin(async move {
            let topology = ctx.services.renderer.topology(&ctx.registry);
            let path = topology.write_to(&ctx.services.config.staging_dir)?;
            info!(nodes = topology.len(), path = %path.display(), "topology rendered");
            ctx.config_txt = Some(path);
            ctx.topology = Some(topology);
            Ok(())
        })
    })
}

pub(super) fn chart(action: ChartAction) -> Step<Ctx> {
    let name = match action {
        ChartAction::Install => "install chart",
        ChartAction::Upgrade => "upgrade chart",
    };
    Step::new(name, move |ctx: &mut Ctx| {
        Box::pin(async move {
            let config = &ctx.services.config;
            let values = ChartValues::from_topology(&config.chart_release, &config.namespace, ctx.topology()?);
            match action {
                ChartAction::Install => ctx.services.chart.install(&values).await,
                ChartAction::Upgrade => ctx.services.chart.upgrade(&values).await,
            }
        })
    })
}

pub(super) fn freeze(services: &Services) -> Step<Ctx> {
    Step::new("freeze network", |ctx: &mut Ctx| {
        Box::pin(async move {
            let node = ctx
                .freeze_node()
                .ok_or_else(|| DeployError::InvalidOperation("no running node to freeze from".into()))?;
            ctx.services
                .staging
                .exec(&node, &ctx.services.config.freeze_command)
                .await?;
            info!(%node, "network frozen");
            Ok(())
        })
    })
    .retry(retry(services))
    .skip_if(|ctx: &Ctx| ctx.operation == LifecycleOperation::Deploy)
}

pub(super) fn stage(services: &Services) -> Step<Ctx> {
    Step::per_node(
        "stage files",
        |ctx: &Ctx| ctx.recipients(),
        |ctx: &Ctx, node: String| {
            let staging = ctx.services.staging.clone();
            let prepared = NodeAlias::parse(&node).map(|alias| {
                let plan = ctx.plan_for(&alias);
                (alias, plan)
            });
            Box::pin(async move {
                let (alias, plan) = prepared?;
                staging.apply(&alias, &plan).await
            })
        },
    )
    .retry(retry(services))
}

pub(super) fn restart(services: &Services) -> Step<Ctx> {
    Step::per_node(
        "restart nodes",
        |ctx: &Ctx| ctx.recipients(),
        |ctx: &Ctx, node: String| {
            let staging = ctx.services.staging.clone();
            let command = ctx.services.config.restart_command.clone();
            Box::pin(async move {
                let alias = NodeAlias::parse(&node)?;
                staging.exec(&alias, &command).await?;
                Ok(())
            })
        },
    )
    .retry(retry(services))
}

pub(super) fn await_active(services: &Services) -> Step<Ctx> {
    Step::per_node(
        "await activation",
        |ctx: &Ctx| ctx.recipients(),
        |ctx: &Ctx, node: String| {
            let staging = ctx.services.staging.clone();
            let policy = ctx.services.config.activation.clone();
            Box::pin(async move {
                let alias = NodeAlias::parse(&node)?;
                staging.await_active(&alias, &policy).await
            })
        },
    )
    .retry(retry(services))
}

/// Read the address book back from the target's pod and compare it with
/// what was rendered.
pub(super) fn verify_staged_config(services: &Services) -> Step<Ctx> {
    Step::new("verify staged config", |ctx: &mut Ctx| {
        Box::pin(async move {
            let node = ctx.target()?.clone();
            let staging = &ctx.services.staging;
            let remote = format!("{}/{CONFIG_TXT}", staging.config_dir());
            let local_dir = ctx.services.config.staging_dir.join("fetched").join(node.as_str());

            let fetched = staging.fetch(&node, &remote, &local_dir).await?;
            let text = std::fs::read_to_string(&fetched).map_err(|e| DeployError::io(&fetched, e))?;
            if text != ctx.topology()?.render() {
                warn!(%node, path = %remote, "staged address book differs from rendered");
                return Err(DeployError::RemoteStaging {
                    node,
                    path: remote,
                    message: "content differs from rendered topology".into(),
                });
            }
            Ok(())
        })
    })
    .retry(retry(services))
    .skip_if(|ctx: &Ctx| {
        ctx.target
            .as_ref()
            .map_or(true, |t| !ctx.recipients().iter().any(|r| r == t.as_str()))
    })
}

pub(super) fn persist_registry() -> Step<Ctx> {
    Step::new("persist registry", |ctx: &mut Ctx| {
        Box::pin(async move {
            ctx.registry.save(&ctx.services.config.registry_path)?;
            info!(nodes = ctx.registry.len(), "registry saved");
            Ok(())
        })
    })
}
