//! First deployment of a network.

use deploy_keys::KeyFormat;
use tracing::info;

use super::context::{OperationContext, Services};
use super::steps;
use crate::chart::ChartAction;
use crate::error::DeployError;
use crate::pipeline::{Pipeline, Step};

type Ctx = OperationContext;

pub(super) fn pipeline(services: &Services) -> Pipeline<Ctx> {
    Pipeline::new("deploy network", services.config.max_concurrency)
        .step(Step::new("validate", |ctx: &mut Ctx| {
            Box::pin(async move {
                if !ctx.registry.is_empty() {
                    return Err(DeployError::InvalidOperation(format!(
                        "network already has {} node(s); add nodes individually",
                        ctx.registry.len()
                    )));
                }
                steps::check_key_format(ctx)
            })
        }))
        .step(
            Step::new("generate keys", |ctx: &mut Ctx| {
                Box::pin(async move {
                    let services = ctx.services.clone();
                    for node in ctx.targets.clone() {
                        let gossip = !services.has_gossip_keys(&node);
                        let tls = !services.has_tls_key(&node);
                        if gossip || tls {
                            // Half-present material is replaced, not mixed.
                            services.backup.backup_files(&services.key_files(&node, gossip, tls))?;
                            ctx.fresh.push(node.clone());
                            services.generate_keys(&node, gossip, tls)?;
                        }
                        if !gossip && services.key_format() == KeyFormat::Pkcs12 {
                            services.pfx.update_public_pfx_key(&node)?;
                        }
                        info!(%node, reused = !(gossip || tls), "keys ready");
                    }
                    ctx.stage_gossip = true;
                    ctx.stage_tls = true;
                    Ok(())
                })
            })
            .on_rollback(|ctx: &mut Ctx| Box::pin(steps::retire_fresh_keys(ctx))),
        )
        .step(Step::new("register nodes", |ctx: &mut Ctx| {
            Box::pin(async move {
                let config = &ctx.services.config;
                for node in &ctx.targets {
                    ctx.registry
                        .add(node.clone(), config.default_weight, config.first_account)?;
                }
                Ok(())
            })
        }))
        .step(steps::render_topology())
        .step(steps::chart(ChartAction::Install))
        .step(steps::stage(services))
        .step(steps::restart(services))
        .step(steps::await_active(services))
        .step(steps::persist_registry())
}
