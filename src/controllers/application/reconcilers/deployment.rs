use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::*;

use super::addons::{addon_credentials, report_credentials_failure};
use super::{namespace, ReconcileResult, Reconciler};
use crate::conditions::{self, ConditionStatus, APP_AVAILABLE, APP_PROGRESSING};
use crate::controllers::application::builders::deployment::{build_deployment, snapshot_matches};
use crate::controllers::application::builders::env::app_env;
use crate::controllers::application::builders::resolve::resolve_autoscaling;
use crate::controllers::application::builders::{
    children_selector, is_owned_by, process_resource_name, process_selector, PROCESS_NAME_LABEL,
    RESOURCE_TYPE_PROCESS,
};
use crate::controllers::application::controller::Context;
use crate::controllers::application::health::{deployment_health, pod_failure_message};
use crate::controllers::application::upsert::{delete_ignore_missing, upsert, UpdateDecision};
use crate::resources::applications::{
    AppPhase, Application, HealthPhase, LAST_SYNCED_SERIALIZED_APP_ANNOTATION,
    SKIP_UPDATE_ANNOTATION,
};
use crate::{Error, Result};

/// Converges one Deployment per process and folds their health into the application status
pub struct DeploymentReconciler;

#[async_trait]
impl Reconciler for DeploymentReconciler {
    fn name(&self) -> &'static str {
        "deployments"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        match converge_deployments(ctx, app).await {
            Ok(result) => result,
            Err(err @ (Error::InvalidProcessConfig { .. } | Error::InvalidAnnotations(_))) => {
                set_available(app, ConditionStatus::False, "InvalidConfig", err.to_string());
                app.status_mut().phase = AppPhase::Failed;
                ReconcileResult::end_with_error(err)
            }
            // only the credential lookup talks to the add-on service here
            Err(err @ (Error::AddonProvisionFailed(_) | Error::AddonApiCall(_))) => {
                report_credentials_failure(app, &err);
                ReconcileResult::with_error(err)
            }
            Err(err) => ReconcileResult::with_error(err),
        }
    }
}

fn set_available(app: &mut Application, status: ConditionStatus, reason: &str, message: impl Into<String>) {
    let generation = app.metadata.generation;
    conditions::set(
        &mut app.status_mut().conditions,
        APP_AVAILABLE,
        status,
        reason,
        message,
        generation,
    );
}

/// How an existing Deployment that no longer matches the application is brought up to date
fn update_policy(existing: &Deployment, desired: &Deployment) -> UpdateDecision {
    let annotations = existing.annotations();
    if annotations
        .get(SKIP_UPDATE_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        return UpdateDecision::Skip;
    }

    // Deployments created before the snapshot annotation existed only get the annotation,
    // a full update would restart every pod for bookkeeping alone.
    if !annotations.contains_key(LAST_SYNCED_SERIALIZED_APP_ANNOTATION) {
        let snapshot = desired
            .annotations()
            .get(LAST_SYNCED_SERIALIZED_APP_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        return UpdateDecision::Patch(json!({
            "metadata": {"annotations": {LAST_SYNCED_SERIALIZED_APP_ANNOTATION: snapshot}}
        }));
    }

    UpdateDecision::Replace
}

async fn converge_deployments(ctx: &Context, app: &mut Application) -> Result<ReconcileResult> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace(app));
    let selector = children_selector(app, RESOURCE_TYPE_PROCESS);
    let existing: Vec<Deployment> = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .into_iter()
        .filter(|d| is_owned_by(d, app))
        .collect();

    let mut env: Option<Vec<EnvVar>> = None;
    let mut current = Vec::with_capacity(app.spec.processes.len());
    let mut desired_names = BTreeSet::new();

    for process in &app.spec.processes {
        let name = process_resource_name(app, &process.name);
        desired_names.insert(name.clone());
        let live = existing.iter().find(|d| d.name_any() == name);

        if let Some(live) = live.filter(|live| snapshot_matches(app, live)) {
            current.push(live.clone());
            continue;
        }

        if env.is_none() {
            env = Some(app_env(app, &addon_credentials(ctx, app).await?));
        }
        let mut desired = build_deployment(app, process, env.clone().unwrap_or_default())?;

        // the autoscaler owns the replica count of autoscaled processes
        if let Some(live_replicas) = live.and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas) {
            if resolve_autoscaling(app, process).is_some() {
                if let Some(spec) = desired.spec.as_mut() {
                    spec.replicas = Some(live_replicas);
                }
            }
        }

        info!("Syncing deployment {name}");
        current.push(upsert(&api, &ctx.metrics, desired, update_policy).await?);
    }

    for stale in existing.iter().filter(|d| !desired_names.contains(&d.name_any())) {
        info!("Deleting deployment {} of a removed process", stale.name_any());
        delete_ignore_missing(&api, &ctx.metrics, &stale.name_any(), &DeleteParams::default()).await?;
    }

    aggregate_health(ctx, app, &current).await
}

async fn aggregate_health(
    ctx: &Context,
    app: &mut Application,
    deployments: &[Deployment],
) -> Result<ReconcileResult> {
    if deployments.is_empty() {
        app.status_mut().phase = AppPhase::Failed;
        set_available(app, ConditionStatus::False, "Teardown", "no running processes");
        return Ok(ReconcileResult::proceed());
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace(app));
    let mut healthy = 0;
    let mut failure = None;

    for deployment in deployments {
        let health = deployment_health(deployment);
        match health.phase {
            HealthPhase::Healthy => healthy += 1,
            HealthPhase::Unhealthy => {
                let process = deployment
                    .labels()
                    .get(PROCESS_NAME_LABEL)
                    .cloned()
                    .unwrap_or_default();
                let selector = process_selector(app, &process)
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                let cause = pods
                    .list(&ListParams::default().labels(&selector))
                    .await?
                    .items
                    .iter()
                    .find_map(pod_failure_message);

                match cause {
                    Some(message) => {
                        warn!("Process {process} is failing: {message}");
                        failure.get_or_insert((health.reason, message));
                    }
                    None => debug!(
                        "Deployment {} reports {} without a failing pod, still progressing",
                        deployment.name_any(),
                        health.reason
                    ),
                }
            }
            HealthPhase::Progressing | HealthPhase::Unknown => {}
        }
    }

    let generation = app.metadata.generation;
    if let Some((reason, message)) = failure {
        app.status_mut().phase = AppPhase::Failed;
        set_available(app, ConditionStatus::False, &reason, message);
        return Ok(ReconcileResult::requeue(ctx.config.error_requeue_after));
    }

    if healthy == deployments.len() {
        app.status_mut().phase = AppPhase::Running;
        set_available(app, ConditionStatus::True, "AppAvailable", "");
        conditions::set(
            &mut app.status_mut().conditions,
            APP_PROGRESSING,
            ConditionStatus::False,
            "Finished",
            "",
            generation,
        );
        return Ok(ReconcileResult::proceed());
    }

    app.status_mut().phase = AppPhase::Pending;
    set_available(
        app,
        ConditionStatus::False,
        "Progressing",
        format!("{healthy}/{} processes available", deployments.len()),
    );
    Ok(ReconcileResult::requeue(ctx.config.requeue_after))
}
