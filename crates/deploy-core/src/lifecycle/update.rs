//! Reconfiguring one node: key rotation and weight changes.

use deploy_keys::{KeyRole, NodeAlias};
use tracing::{debug, info};

use super::context::{OperationContext, Services};
use super::{steps, TlsRotation};
use crate::error::{DeployError, Result};
use crate::pipeline::{Pipeline, Step};

type Ctx = OperationContext;

pub(super) fn pipeline(services: &Services) -> Pipeline<Ctx> {
    Pipeline::new("update node", services.config.max_concurrency)
        .step(Step::new("validate", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?;
                if !ctx.registry.contains(node) {
                    return Err(DeployError::NodeNotFound(node.clone()));
                }
                if ctx.update.weight == Some(0) {
                    return Err(DeployError::InvalidOperation("node weight must be positive".into()));
                }
                steps::check_key_format(ctx)
            })
        }))
        .step(Step::new("plan key rotation", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?.clone();
                ctx.stage_gossip = ctx.update.rotate_gossip;
                ctx.stage_tls = rotate_tls(ctx, &node)?;
                info!(%node, gossip = ctx.stage_gossip, tls = ctx.stage_tls, "key rotation planned");
                Ok(())
            })
        }))
        .step(steps::snapshot_untouched())
        .step(
            Step::new("regenerate keys", |ctx: &mut Ctx| {
                Box::pin(async move {
                    let node = ctx.target()?.clone();
                    let services = ctx.services.clone();
                    let (gossip, tls) = (ctx.stage_gossip, ctx.stage_tls);

                    if let Some(dir) = services.backup.backup_files(&services.key_files(&node, gossip, tls))? {
                        info!(%node, backup = %dir.display(), "backed up keys before rotation");
                        ctx.backups.push(dir);
                    }
                    services.generate_keys(&node, gossip, tls)?;
                    Ok(())
                })
            })
            .skip_if(|ctx: &Ctx| !ctx.stage_gossip && !ctx.stage_tls)
            .on_rollback(|ctx: &mut Ctx| Box::pin(steps::restore_backups(ctx))),
        )
        .step(steps::verify_untouched())
        .step(
            Step::new("set weight", |ctx: &mut Ctx| {
                Box::pin(async move {
                    let node = ctx.target()?.clone();
                    if let Some(weight) = ctx.update.weight {
                        ctx.registry.set_weight(&node, weight)?;
                        info!(%node, weight, "weight updated");
                    }
                    Ok(())
                })
            })
            .skip_if(|ctx: &Ctx| ctx.update.weight.is_none()),
        )
        .step(steps::render_topology())
        .step(steps::freeze(services))
        .step(steps::stage(services))
        .step(steps::restart(services))
        .step(steps::await_active(services))
        .step(steps::verify_staged_config(services))
        .step(steps::persist_registry())
}

fn rotate_tls(ctx: &Ctx, node: &NodeAlias) -> Result<bool> {
    let services = &ctx.services;
    match ctx.update.tls {
        TlsRotation::Never => Ok(false),
        TlsRotation::Always => Ok(true),
        TlsRotation::WhenExpiring => {
            if !services.has_tls_key(node) {
                debug!(%node, "no TLS key on disk, rotating");
                return Ok(true);
            }
            let key = services.keys.load_node_key(
                node,
                &services.config.key_dir,
                KeyRole::Tls,
                &KeyRole::Tls.file_names(node),
            )?;
            let now = services.now();
            let due = key.certificate().needs_rotation(now);
            debug!(
                %node,
                not_after = key.certificate().not_after_epoch(),
                due,
                "checked TLS certificate"
            );
            Ok(due)
        }
    }
}
