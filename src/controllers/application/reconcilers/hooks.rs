use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use tracing::*;

use super::addons::{addon_credentials, report_credentials_failure};
use super::{namespace, ReconcileResult, Reconciler};
use crate::conditions::{self, ConditionStatus, HOOKS_FINISHED};
use crate::controllers::application::builders::env::app_env;
use crate::controllers::application::builders::{
    children_selector, hook_pod_name, is_owned_by, RESOURCE_TYPE_HOOK,
};
use crate::controllers::application::builders::pod::hook_pod;
use crate::controllers::application::controller::Context;
use crate::controllers::application::health::{pod_health, pod_is_running, HealthStatus};
use crate::controllers::application::upsert::delete_ignore_missing;
use crate::resources::applications::{AppPhase, Application, HealthPhase, HookStatus, HookType};
use crate::{Error, Result};

/// Supervises the pre-release hook pod of the current deploy
pub struct HookReconciler;

#[async_trait]
impl Reconciler for HookReconciler {
    fn name(&self) -> &'static str {
        "hooks"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        reconcile_pre_release(ctx, app)
            .await
            .unwrap_or_else(ReconcileResult::with_error)
    }
}

fn set_hooks_finished(app: &mut Application, status: ConditionStatus, reason: &str, message: impl Into<String>) {
    let generation = app.metadata.generation;
    conditions::set(
        &mut app.status_mut().conditions,
        HOOKS_FINISHED,
        status,
        reason,
        message,
        generation,
    );
}

fn current_deploy_id(app: &Application) -> String {
    match app.status.as_ref().map(|s| s.deploy_id.as_str()) {
        Some("") | None => app.deploy_id(),
        Some(id) => id.to_string(),
    }
}

fn elapsed_since(start: Option<&Time>, now: DateTime<Utc>) -> Duration {
    start
        .and_then(|start| (now - start.0).to_std().ok())
        .unwrap_or_default()
}

/// Fold an observation of the live pod into the recorded hook status.
/// A recorded start time or started flag is never cleared.
fn merge_observation(status: &mut HookStatus, pod: &Pod, health: &HealthStatus, now: DateTime<Utc>) {
    status.started = true;
    if status.start_time.is_none() {
        status.start_time = pod
            .status
            .as_ref()
            .and_then(|s| s.start_time.clone())
            .or_else(|| pod.metadata.creation_timestamp.clone())
            .or(Some(Time(now)));
    }
    if status.phase != health.phase || status.last_transition_time.is_none() {
        status.last_transition_time = Some(Time(now));
    }
    status.phase = health.phase;
    status.reason = health.reason.clone();
    status.message = health.message.clone();
}

/// Re-read the hook pod of `deploy_id` and record what it is doing now.
/// Returns the updated status, or `None` when the application never ran this hook.
pub async fn check_and_update_hook_status(
    ctx: &Context,
    app: &mut Application,
    hook_type: HookType,
    deploy_id: &str,
) -> Result<Option<HookStatus>> {
    let Some(mut status) = app.hook_status(hook_type).cloned() else {
        return Ok(None);
    };

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace(app));
    let name = hook_pod_name(app, hook_type, deploy_id);

    match pods.get_opt(&name).await? {
        Some(pod) => merge_observation(&mut status, &pod, &pod_health(&pod), Utc::now()),
        // the pod is gone, so whatever it was doing has stopped
        None if status.phase == HealthPhase::Progressing => {
            status.phase = HealthPhase::Unknown;
            status.reason = "PodMissing".into();
            status.message = format!("hook pod {name} no longer exists");
            status.last_transition_time = Some(Time(Utc::now()));
        }
        None => {}
    }

    app.status_mut().set_hook_status(status.clone());
    Ok(Some(status))
}

/// Delete hook pods of earlier deploys that are no longer running.
/// A pod that still runs is left alone until a later pass sees it stop.
async fn prune_superseded_hook_pods(
    ctx: &Context,
    app: &Application,
    pods: &Api<Pod>,
    current: Option<&str>,
) -> Result<()> {
    let superseded = pods
        .list(&ListParams::default().labels(&children_selector(app, RESOURCE_TYPE_HOOK)))
        .await?
        .items
        .into_iter()
        .filter(|p| is_owned_by(p, app) && !pod_is_running(p))
        .filter(|p| current != Some(p.name_any().as_str()));

    for pod in superseded {
        info!("Deleting superseded hook pod {}", pod.name_any());
        delete_ignore_missing(pods, &ctx.metrics, &pod.name_any(), &DeleteParams::default()).await?;
    }
    Ok(())
}

async fn reconcile_pre_release(ctx: &Context, app: &mut Application) -> Result<ReconcileResult> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace(app));

    let Some(hook) = app.spec.pre_release_hook().cloned() else {
        prune_superseded_hook_pods(ctx, app, &pods, None).await?;
        set_hooks_finished(app, ConditionStatus::Unknown, "Disabled", "no hook declared");
        return Ok(ReconcileResult::proceed());
    };

    let hook_type = HookType::PreRelease;
    let deploy_id = current_deploy_id(app);
    let name = hook_pod_name(app, hook_type, &deploy_id);
    prune_superseded_hook_pods(ctx, app, &pods, Some(&name)).await?;
    let recorded = app.hook_status(hook_type).cloned();

    let Some(pod) = pods.get_opt(&name).await? else {
        match recorded {
            Some(status) if status.started && status.phase == HealthPhase::Healthy => {
                set_hooks_finished(app, ConditionStatus::True, "Finished", "");
                return Ok(ReconcileResult::proceed());
            }
            Some(status) if status.started && status.phase == HealthPhase::Unhealthy => {
                return Ok(ReconcileResult::end_with_error(Error::HookFailed {
                    pod: name,
                    message: status.message,
                }));
            }
            _ => {}
        }

        let credentials = match addon_credentials(ctx, app).await {
            Ok(credentials) => credentials,
            Err(err) => {
                report_credentials_failure(app, &err);
                return Ok(ReconcileResult::with_error(err));
            }
        };
        let env = app_env(app, &credentials);
        let pod = match hook_pod(app, hook_type, &hook, &deploy_id, env) {
            Ok(pod) => pod,
            Err(err @ (Error::InvalidProcessConfig { .. } | Error::InvalidAnnotations(_))) => {
                set_hooks_finished(app, ConditionStatus::False, "InvalidConfig", err.to_string());
                app.status_mut().phase = AppPhase::Failed;
                return Ok(ReconcileResult::end_with_error(err));
            }
            Err(err) => return Err(err),
        };

        info!("Dispatching {} hook pod {name}", hook_type.as_str());
        ctx.metrics.child_write::<Pod>("create");
        match pods.create(&PostParams::default(), &pod).await {
            Err(kube::Error::Api(kube::error::ErrorResponse { code: 409, .. })) => {
                // someone else created it after our read, the next pass adopts it
                warn!("Hook pod {name} appeared before it could be created");
                set_hooks_finished(
                    app,
                    ConditionStatus::False,
                    "PodExists",
                    format!("hook pod {name} already exists"),
                );
                return Ok(ReconcileResult::with_error(Error::HookPodExists(name)));
            }
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }

        let now = Utc::now();
        app.status_mut().set_hook_status(HookStatus {
            type_: hook_type,
            started: true,
            start_time: Some(Time(now)),
            phase: HealthPhase::Progressing,
            reason: "Dispatched".into(),
            message: format!("hook pod {name} created"),
            last_transition_time: Some(Time(now)),
        });
        set_hooks_finished(app, ConditionStatus::False, "Progressing", "hook is running");
        return Ok(ReconcileResult::requeue(ctx.config.requeue_after));
    };

    let now = Utc::now();
    let health = pod_health(&pod);
    let already_finished = recorded
        .as_ref()
        .is_some_and(|s| s.phase == HealthPhase::Healthy);
    let mut status = recorded.unwrap_or(HookStatus {
        type_: hook_type,
        ..Default::default()
    });
    merge_observation(&mut status, &pod, &health, now);
    let elapsed = elapsed_since(status.start_time.as_ref(), now);

    if !already_finished && elapsed > ctx.config.hook_running_timeout {
        warn!("Hook pod {name} exceeded the running timeout after {}s", elapsed.as_secs());
        status.phase = HealthPhase::Unhealthy;
        status.reason = "Timeout".into();
        status.message = format!("hook did not finish within {}s", ctx.config.hook_running_timeout.as_secs());
        app.status_mut().set_hook_status(status);
        app.status_mut().phase = AppPhase::Failed;
        set_hooks_finished(app, ConditionStatus::False, "Timeout", "hook timed out");

        delete_ignore_missing(&pods, &ctx.metrics, &name, &DeleteParams::default()).await?;
        return Ok(ReconcileResult::with_error(Error::HookTimeout { pod: name, elapsed }));
    }

    app.status_mut().set_hook_status(status);

    match health.phase {
        HealthPhase::Healthy => {
            set_hooks_finished(app, ConditionStatus::True, "Finished", "");
            Ok(ReconcileResult::proceed())
        }
        HealthPhase::Unhealthy => {
            app.status_mut().phase = AppPhase::Failed;
            set_hooks_finished(app, ConditionStatus::False, "Failed", health.message.clone());
            let err = Error::HookFailed {
                pod: name.clone(),
                message: health.message,
            };

            if elapsed <= ctx.config.hook_failed_grace {
                return Ok(ReconcileResult::with_error(err));
            }

            delete_ignore_missing(&pods, &ctx.metrics, &name, &DeleteParams::default()).await?;
            Ok(ReconcileResult::end_with_error(err))
        }
        HealthPhase::Progressing | HealthPhase::Unknown => {
            set_hooks_finished(app, ConditionStatus::False, "Progressing", health.message);
            Ok(ReconcileResult::requeue(ctx.config.requeue_after))
        }
    }
}
