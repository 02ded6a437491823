//! Adding a node to a running network.

use tracing::info;

use super::context::{OperationContext, Services};
use super::steps;
use crate::chart::ChartAction;
use crate::error::DeployError;
use crate::pipeline::{Pipeline, Step};

type Ctx = OperationContext;

pub(super) fn pipeline(services: &Services) -> Pipeline<Ctx> {
    Pipeline::new("add node", services.config.max_concurrency)
        .step(Step::new("validate", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?;
                if ctx.registry.contains(node) {
                    return Err(DeployError::NodeAlreadyExists(node.clone()));
                }
                steps::check_key_format(ctx)
            })
        }))
        .step(steps::snapshot_untouched())
        .step(
            Step::new("generate keys", |ctx: &mut Ctx| {
                Box::pin(async move {
                    let node = ctx.target()?.clone();
                    let services = ctx.services.clone();

                    // Leftovers under the new node's name (an earlier failed
                    // attempt, say) are set aside rather than reused.
                    if let Some(dir) = services.backup.backup_files(&services.key_files(&node, true, true))? {
                        info!(%node, backup = %dir.display(), "moved stale key files aside");
                    }
                    ctx.fresh.push(node.clone());
                    services.generate_keys(&node, true, true)?;

                    ctx.stage_gossip = true;
                    ctx.stage_tls = true;
                    Ok(())
                })
            })
            .on_rollback(|ctx: &mut Ctx| Box::pin(steps::retire_fresh_keys(ctx))),
        )
        .step(steps::verify_untouched())
        .step(Step::new("register node", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?.clone();
                let config = &ctx.services.config;
                let record = ctx
                    .registry
                    .add(node, config.default_weight, config.first_account)?;
                info!(node = %record.alias, node_id = record.node_id, account = record.account_num, "node registered");
                Ok(())
            })
        }))
        .step(steps::render_topology())
        .step(steps::chart(ChartAction::Upgrade))
        .step(steps::freeze(services))
        .step(steps::stage(services))
        .step(steps::restart(services))
        .step(steps::await_active(services))
        .step(steps::verify_staged_config(services))
        .step(steps::persist_registry())
}
