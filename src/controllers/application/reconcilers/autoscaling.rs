use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;
use tracing::*;

use super::{namespace, ReconcileResult, Reconciler};
use crate::controllers::application::builders::autoscaler::{autoscaler_bounds, build_autoscaler};
use crate::controllers::application::builders::resolve::resolve_autoscaling;
use crate::controllers::application::builders::{
    children_selector, is_owned_by, process_resource_name, RESOURCE_TYPE_PROCESS,
};
use crate::controllers::application::controller::Context;
use crate::controllers::application::upsert::{delete_ignore_missing, upsert, UpdateDecision};
use crate::resources::applications::Application;
use crate::Result;

/// Keeps one autoscaler per process that has autoscaling enabled
pub struct AutoscalingReconciler;

#[async_trait]
impl Reconciler for AutoscalingReconciler {
    fn name(&self) -> &'static str {
        "autoscaling"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        match converge_autoscalers(ctx, app).await {
            Ok(()) => ReconcileResult::proceed(),
            Err(err) => ReconcileResult::with_error(err),
        }
    }
}

async fn converge_autoscalers(ctx: &Context, app: &Application) -> Result<()> {
    let api: Api<HorizontalPodAutoscaler> = Api::namespaced(ctx.client.clone(), namespace(app));

    let mut wanted = BTreeSet::new();
    for process in &app.spec.processes {
        let Some(autoscaling) = resolve_autoscaling(app, process) else {
            continue;
        };
        wanted.insert(process_resource_name(app, &process.name));
        let desired = build_autoscaler(app, process, &autoscaling)?;
        upsert(&api, &ctx.metrics, desired, |existing, desired| {
            if autoscaler_bounds(existing) == autoscaler_bounds(desired) {
                UpdateDecision::Skip
            } else {
                UpdateDecision::Replace
            }
        })
        .await?;
    }

    let existing = api
        .list(&ListParams::default().labels(&children_selector(app, RESOURCE_TYPE_PROCESS)))
        .await?;
    for stale in existing
        .items
        .iter()
        .filter(|hpa| is_owned_by(*hpa, app) && !wanted.contains(&hpa.name_any()))
    {
        info!("Deleting autoscaler {}", stale.name_any());
        delete_ignore_missing(&api, &ctx.metrics, &stale.name_any(), &DeleteParams::default()).await?;
    }
    Ok(())
}
