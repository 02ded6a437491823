//! Ordered step executor with per-step retry, skip and rollback.
//!
//! A [`Pipeline`] runs its [`Step`]s strictly in order against a shared
//! context. A step is either a single action that may mutate the context,
//! or a per-node fan-out whose tasks run concurrently up to the pipeline's
//! concurrency bound. The first fatal failure halts the pipeline, runs the
//! rollback hooks of completed steps in reverse, and is reported as a
//! [`PipelineError`] naming the step, the node and the progress made.
//!
//! Only errors with [`DeployError::is_retryable`] are retried, with
//! exponential backoff from the step's [`RetryPolicy`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::config::RetryConfig;
use crate::error::{DeployError, PipelineError, Result};

/// Boxed future returned by step actions.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

type Action<C> = Box<dyn for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync>;
type Targets<C> = Box<dyn Fn(&C) -> Vec<String> + Send + Sync>;
type Task<C> = Box<dyn Fn(&C, String) -> StepFuture<'static> + Send + Sync>;
type Predicate<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

/// How often and how patiently a step is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
    };

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
        }
    }
}

enum StepKind<C> {
    Single(Action<C>),
    PerNode { targets: Targets<C>, task: Task<C> },
}

/// A named pipeline step.
pub struct Step<C> {
    name: String,
    kind: StepKind<C>,
    retry: RetryPolicy,
    skip_if: Option<Predicate<C>>,
    rollback: Option<Action<C>>,
}

impl<C> Step<C> {
    /// A step running `action` once against the context.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::Single(Box::new(action)),
            retry: RetryPolicy::NONE,
            skip_if: None,
            rollback: None,
        }
    }

    /// A step running `task` for every node `targets` returns. Tasks only
    /// read the context, so they can run concurrently.
    pub fn per_node<T, F>(name: impl Into<String>, targets: T, task: F) -> Self
    where
        T: Fn(&C) -> Vec<String> + Send + Sync + 'static,
        F: Fn(&C, String) -> StepFuture<'static> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: StepKind::PerNode {
                targets: Box::new(targets),
                task: Box::new(task),
            },
            retry: RetryPolicy::NONE,
            skip_if: None,
            rollback: None,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Skip the step when `predicate` holds at the time it would run.
    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.skip_if = Some(Box::new(predicate));
        self
    }

    /// Undo hook run if a later step fails fatally.
    pub fn on_rollback<F>(mut self, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.rollback = Some(Box::new(action));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Steps completed and skipped by a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Failure inside one step, before progress bookkeeping is attached.
struct StepFailure {
    node: Option<String>,
    attempts: u32,
    updated_nodes: Vec<String>,
    error: DeployError,
}

pub struct Pipeline<C> {
    name: String,
    steps: Vec<Step<C>>,
    max_concurrency: usize,
}

impl<C: Send> Pipeline<C> {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn step(mut self, step: Step<C>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    /// Run every step in order.
    pub async fn run(&self, ctx: &mut C) -> std::result::Result<PipelineOutcome, PipelineError> {
        let span = info_span!("pipeline", name = %self.name);
        async {
            let mut outcome = PipelineOutcome::default();
            let mut completed_idx = Vec::new();

            for (idx, step) in self.steps.iter().enumerate() {
                if step.skip_if.as_ref().is_some_and(|skip| skip(&*ctx)) {
                    info!(step = %step.name, "step skipped");
                    outcome.skipped.push(step.name.clone());
                    continue;
                }

                let result = self
                    .run_step(step, ctx)
                    .instrument(info_span!("step", step = %step.name))
                    .await;

                match result {
                    Ok(()) => {
                        info!(step = %step.name, "step complete");
                        outcome.completed.push(step.name.clone());
                        completed_idx.push(idx);
                    }
                    Err(failure) => {
                        warn!(
                            step = %step.name,
                            node = failure.node.as_deref().unwrap_or("-"),
                            error = %failure.error,
                            "step failed, halting pipeline"
                        );
                        self.roll_back(&completed_idx, ctx).await;
                        return Err(PipelineError {
                            step: step.name.clone(),
                            node: failure.node,
                            attempts: failure.attempts,
                            completed_steps: outcome.completed,
                            updated_nodes: failure.updated_nodes,
                            source: failure.error,
                        });
                    }
                }
            }

            info!(steps = outcome.completed.len(), "pipeline complete");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn run_step(&self, step: &Step<C>, ctx: &mut C) -> std::result::Result<(), StepFailure> {
        match &step.kind {
            StepKind::Single(action) => {
                let mut attempt = 1;
                loop {
                    match action(&mut *ctx).await {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_retryable() && attempt < step.retry.max_attempts => {
                            let delay = step.retry.delay_after(attempt);
                            warn!(attempt, error = %e, ?delay, "retrying step");
                            sleep(delay).await;
                            attempt += 1;
                        }
                        Err(error) => {
                            return Err(StepFailure {
                                node: None,
                                attempts: attempt,
                                updated_nodes: Vec::new(),
                                error,
                            })
                        }
                    }
                }
            }
            StepKind::PerNode { targets, task } => {
                self.run_fan_out(step.retry, targets(&*ctx), task, &*ctx).await
            }
        }
    }

    async fn run_fan_out(
        &self,
        retry: RetryPolicy,
        nodes: Vec<String>,
        task: &Task<C>,
        ctx: &C,
    ) -> std::result::Result<(), StepFailure> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set: JoinSet<(String, u32, Result<()>)> = JoinSet::new();

        let spawn = |set: &mut JoinSet<_>, node: String, attempt: u32, delay: Duration| {
            let fut = task(ctx, node.clone());
            let permits = permits.clone();
            set.spawn(async move {
                sleep(delay).await;
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => fut.await,
                    Err(_) => Err(DeployError::InvalidOperation("fan-out semaphore closed".into())),
                };
                (node, attempt, result)
            });
        };

        for node in nodes {
            spawn(&mut set, node, 1, Duration::ZERO);
        }

        let mut updated = Vec::new();
        let mut failure: Option<StepFailure> = None;
        while let Some(joined) = set.join_next().await {
            let (node, attempt, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    failure.get_or_insert(StepFailure {
                        node: None,
                        attempts: 1,
                        updated_nodes: Vec::new(),
                        error: DeployError::InvalidOperation(format!("fan-out task panicked: {e}")),
                    });
                    continue;
                }
            };
            match result {
                Ok(()) => updated.push(node),
                Err(e) if failure.is_none() && e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_after(attempt);
                    warn!(node = %node, attempt, error = %e, ?delay, "retrying node task");
                    spawn(&mut set, node, attempt + 1, delay);
                }
                Err(error) => {
                    // Let tasks already in flight finish so the report
                    // lists every node that was updated.
                    failure.get_or_insert(StepFailure {
                        node: Some(node),
                        attempts: attempt,
                        updated_nodes: Vec::new(),
                        error,
                    });
                }
            }
        }

        updated.sort();
        match failure {
            None => Ok(()),
            Some(mut f) => {
                f.updated_nodes = updated;
                Err(f)
            }
        }
    }

    async fn roll_back(&self, completed: &[usize], ctx: &mut C) {
        for &idx in completed.iter().rev() {
            let step = &self.steps[idx];
            if let Some(rollback) = &step.rollback {
                match rollback(&mut *ctx).await {
                    Ok(()) => info!(step = %step.name, "rolled back"),
                    Err(e) => warn!(step = %step.name, error = %e, "rollback failed"),
                }
            }
        }
    }
}

async fn sleep(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
