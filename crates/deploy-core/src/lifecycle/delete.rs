//! Removing a node from the network.

use tracing::info;

use super::context::{OperationContext, Services};
use super::steps;
use crate::chart::ChartAction;
use crate::error::DeployError;
use crate::pipeline::{Pipeline, Step};

type Ctx = OperationContext;

pub(super) fn pipeline(services: &Services) -> Pipeline<Ctx> {
    Pipeline::new("delete node", services.config.max_concurrency)
        .step(Step::new("validate", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?;
                if !ctx.registry.contains(node) {
                    return Err(DeployError::NodeNotFound(node.clone()));
                }
                if ctx.registry.len() == 1 {
                    return Err(DeployError::InvalidOperation(format!(
                        "{node} is the last node in the network"
                    )));
                }
                steps::check_key_format(ctx)
            })
        }))
        .step(steps::snapshot_untouched())
        .step(
            Step::new("retire keys", |ctx: &mut Ctx| {
                Box::pin(async move {
                    let node = ctx.target()?.clone();
                    if let Some(dir) = ctx.services.retire_keys(&node)? {
                        info!(%node, backup = %dir.display(), "keys retired");
                        ctx.backups.push(dir);
                    }
                    Ok(())
                })
            })
            .on_rollback(|ctx: &mut Ctx| Box::pin(steps::restore_backups(ctx))),
        )
        .step(steps::verify_untouched())
        .step(Step::new("unregister node", |ctx: &mut Ctx| {
            Box::pin(async move {
                let node = ctx.target()?.clone();
                let record = ctx.registry.remove(&node)?;
                info!(%node, node_id = record.node_id, "node unregistered");
                Ok(())
            })
        }))
        .step(steps::render_topology())
        .step(steps::freeze(services))
        .step(steps::stage(services))
        .step(steps::restart(services))
        .step(steps::chart(ChartAction::Upgrade))
        .step(steps::await_active(services))
        .step(steps::persist_registry())
}
