use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use tracing::*;

use super::controller::Context;
use crate::resources::applications::Application;
use crate::{Error, ReconcilerConfig, Result};

pub mod addons;
pub mod autoscaling;
pub mod deployment;
pub mod finalizer;
pub mod hooks;
pub mod revision;
pub mod service;

/// The outcome of one reconcile step.
///
/// A step either lets the pipeline continue, or aborts it by carrying an error, a requeue delay,
/// or the end marker.
#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub err: Option<Error>,
    pub requeue_after: Option<Duration>,
    pub end: bool,
}

impl ReconcileResult {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
            ..Default::default()
        }
    }

    pub fn with_error(err: Error) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }

    /// Stop here; nothing left to do until the application changes
    pub fn end() -> Self {
        Self {
            end: true,
            ..Default::default()
        }
    }

    /// Stop here with an error that retrying will not fix
    pub fn end_with_error(err: Error) -> Self {
        Self {
            err: Some(err),
            end: true,
            ..Default::default()
        }
    }

    pub fn should_abort(&self) -> bool {
        self.err.is_some() || self.requeue_after.is_some() || self.end
    }

    /// Translate into the decision handed back to the controller runtime
    pub fn into_action(self, config: &ReconcilerConfig) -> Result<Action> {
        match self {
            Self { end: true, err, .. } => {
                if let Some(err) = err {
                    warn!("Reconcile ended with a terminal error: {err}");
                }
                Ok(Action::await_change())
            }
            Self { err: Some(err), .. } => Err(err),
            Self { requeue_after, .. } => Ok(Action::requeue(
                requeue_after.unwrap_or(config.requeue_after),
            )),
        }
    }
}

pub(super) fn namespace(app: &Application) -> &str {
    match app.metadata.namespace.as_deref() {
        Some("") | None => "default",
        Some(ns) => ns,
    }
}

/// One step of the application pipeline
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult;
}

/// Runs its reconcilers in order, stopping at the first that aborts
pub struct Pipeline {
    reconcilers: Vec<Box<dyn Reconciler>>,
}

impl Pipeline {
    pub fn new(reconcilers: Vec<Box<dyn Reconciler>>) -> Self {
        Self { reconcilers }
    }

    pub async fn run(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        for reconciler in &self.reconcilers {
            let result = reconciler.reconcile(ctx, app).await;
            if result.should_abort() {
                debug!(
                    "Pipeline stopped at {}: end={} requeue_after={:?} err={:?}",
                    reconciler.name(),
                    result.end,
                    result.requeue_after,
                    result.err.as_ref().map(ToString::to_string),
                );
                return result;
            }
        }
        ReconcileResult::end()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(vec![
            Box::new(revision::RevisionReconciler),
            Box::new(addons::AddonReconciler),
            Box::new(hooks::HookReconciler),
            Box::new(service::ServiceReconciler),
            Box::new(autoscaling::AutoscalingReconciler),
            Box::new(deployment::DeploymentReconciler),
        ])
    }
}
