use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::*;

use super::hooks::check_and_update_hook_status;
use super::{ReconcileResult, Reconciler};
use crate::conditions::{
    self, ConditionStatus, ADDONS_PROVISIONED, APP_AVAILABLE, APP_PROGRESSING, HOOKS_FINISHED,
};
use crate::controllers::application::controller::Context;
use crate::resources::applications::{AppPhase, Application, HealthPhase, HookType};
use crate::{Error, Result};

/// Detects a new revision of the application and resets the status for it
pub struct RevisionReconciler;

#[async_trait]
impl Reconciler for RevisionReconciler {
    fn name(&self) -> &'static str {
        "revision"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        match detect_revision(ctx, app).await {
            Ok(result) => result,
            Err(err) => ReconcileResult::with_error(err),
        }
    }
}

/// A revision is new when either the spec generation or the requested deploy id moved
pub fn is_new_revision(app: &Application) -> bool {
    let generation = app.metadata.generation.unwrap_or(0);
    match app.status.as_ref() {
        None => true,
        Some(status) => status.observed_generation < generation || status.deploy_id != app.deploy_id(),
    }
}

async fn detect_revision(ctx: &Context, app: &mut Application) -> Result<ReconcileResult> {
    if !is_new_revision(app) {
        return Ok(ReconcileResult::proceed());
    }

    // The hook of the previous deploy must settle before the next one starts
    let previous = app
        .hook_status(HookType::PreRelease)
        .filter(|s| s.phase == HealthPhase::Progressing)
        .and(app.status.as_ref())
        .map(|s| s.deploy_id.clone());
    if let Some(previous_deploy_id) = previous {
        let observed =
            check_and_update_hook_status(ctx, app, HookType::PreRelease, &previous_deploy_id).await?;
        if observed.is_some_and(|s| s.phase == HealthPhase::Progressing) {
            info!("Hook of deploy {previous_deploy_id} is still running, holding back the new revision");
            return Ok(ReconcileResult::with_error(Error::LastHookStillRunning));
        }
    }

    let generation = app.metadata.generation;
    let deploy_id = app.deploy_id();
    info!("New revision: generation {:?} deploy {deploy_id}", generation);

    let status = app.status_mut();
    let first_deploy = conditions::find(&status.conditions, APP_AVAILABLE).is_none();

    status.phase = AppPhase::Pending;
    status.hook_statuses.clear();
    status.observed_generation = generation.unwrap_or(0);
    status.deploy_id = deploy_id;
    status.last_update = Some(Time(Utc::now()));

    if first_deploy {
        conditions::set(
            &mut status.conditions,
            APP_AVAILABLE,
            ConditionStatus::False,
            "Progressing",
            "first deployment",
            generation,
        );
    } else {
        conditions::set(
            &mut status.conditions,
            APP_AVAILABLE,
            ConditionStatus::Unknown,
            "NewDeploy",
            "a new deploy is in progress",
            generation,
        );
    }
    conditions::set(
        &mut status.conditions,
        APP_PROGRESSING,
        ConditionStatus::True,
        "NewDeploy",
        "",
        generation,
    );
    conditions::set(
        &mut status.conditions,
        ADDONS_PROVISIONED,
        ConditionStatus::Unknown,
        "NewDeploy",
        "",
        generation,
    );
    conditions::set(
        &mut status.conditions,
        HOOKS_FINISHED,
        ConditionStatus::Unknown,
        "NewDeploy",
        "",
        generation,
    );

    Ok(ReconcileResult::proceed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::find;
    use crate::controllers::application::builders::test_support::{app, with_annotation};
    use crate::controllers::application::fixtures::{test_context, FakeApiServer, StubAddons};
    use crate::resources::applications::{HookStatus, DEPLOY_ID_ANNOTATION};
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    fn demo() -> Application {
        app(
            "demo",
            json!({
                "build": {"image": "registry/demo:v1"},
                "processes": [{"name": "web"}],
                "hooks": {"preRelease": {"command": ["migrate"]}}
            }),
        )
    }

    fn condition(app: &Application, type_: &str) -> (String, String) {
        let c = find(&app.status.as_ref().unwrap().conditions, type_).unwrap();
        (c.status.clone(), c.reason.clone())
    }

    #[tokio::test]
    async fn first_revision_initialises_status() {
        let server = FakeApiServer::start();
        let ctx = test_context(&server, StubAddons::default());
        let mut app = demo();

        let result = RevisionReconciler.reconcile(&ctx, &mut app).await;

        assert!(!result.should_abort());
        let status = app.status.as_ref().unwrap();
        assert_eq!(status.phase, AppPhase::Pending);
        assert_eq!(status.observed_generation, 1);
        assert_eq!(status.deploy_id, "1");
        assert!(status.last_update.is_some());
        assert_eq!(condition(&app, APP_AVAILABLE), ("False".into(), "Progressing".into()));
        assert_eq!(condition(&app, APP_PROGRESSING), ("True".into(), "NewDeploy".into()));
        assert_eq!(condition(&app, ADDONS_PROVISIONED).0, "Unknown");
        assert_eq!(condition(&app, HOOKS_FINISHED).0, "Unknown");
    }

    #[tokio::test]
    async fn unchanged_revision_leaves_status_alone() {
        let server = FakeApiServer::start();
        let ctx = test_context(&server, StubAddons::default());
        let mut app = demo();
        RevisionReconciler.reconcile(&ctx, &mut app).await;
        app.status_mut().phase = AppPhase::Running;
        let before = app.status.clone();

        let result = RevisionReconciler.reconcile(&ctx, &mut app).await;

        assert!(!result.should_abort());
        assert_eq!(app.status, before);
    }

    #[tokio::test]
    async fn deploy_id_or_generation_each_start_a_revision() {
        let server = FakeApiServer::start();
        let ctx = test_context(&server, StubAddons::default());
        let mut app = demo();
        RevisionReconciler.reconcile(&ctx, &mut app).await;
        app.status_mut().phase = AppPhase::Running;

        let mut redeployed = with_annotation(app.clone(), DEPLOY_ID_ANNOTATION, "2");
        assert!(is_new_revision(&redeployed));
        RevisionReconciler.reconcile(&ctx, &mut redeployed).await;
        let status = redeployed.status.as_ref().unwrap();
        assert_eq!(status.deploy_id, "2");
        assert_eq!(status.phase, AppPhase::Pending);
        assert_eq!(
            condition(&redeployed, APP_AVAILABLE),
            ("Unknown".into(), "NewDeploy".into())
        );

        let mut edited = app.clone();
        edited.metadata.generation = Some(2);
        assert!(is_new_revision(&edited));
        RevisionReconciler.reconcile(&ctx, &mut edited).await;
        assert_eq!(edited.status.as_ref().unwrap().observed_generation, 2);
    }

    #[tokio::test]
    async fn running_hook_of_previous_deploy_holds_back_new_revision() {
        let server = FakeApiServer::start();
        let ctx = test_context(&server, StubAddons::default());
        let mut app = demo();
        RevisionReconciler.reconcile(&ctx, &mut app).await;
        app.status_mut().set_hook_status(HookStatus {
            type_: HookType::PreRelease,
            started: true,
            start_time: Some(Time(Utc::now())),
            phase: HealthPhase::Progressing,
            ..Default::default()
        });

        let mut pod = Pod::default();
        pod.metadata.name = Some("pre-release-hook-demo-1".into());
        pod.metadata.namespace = Some("default".into());
        server.insert(&pod);
        server.modify::<Pod>("default", "pre-release-hook-demo-1", |pod| {
            pod["status"] = json!({"phase": "Running"});
        });

        let mut next = with_annotation(app.clone(), DEPLOY_ID_ANNOTATION, "2");
        let result = RevisionReconciler.reconcile(&ctx, &mut next).await;
        assert!(matches!(result.err, Some(Error::LastHookStillRunning)));
        assert_eq!(next.status.as_ref().unwrap().deploy_id, "1");

        server.modify::<Pod>("default", "pre-release-hook-demo-1", |pod| {
            pod["status"] = json!({"phase": "Succeeded"});
        });
        let result = RevisionReconciler.reconcile(&ctx, &mut next).await;
        assert!(!result.should_abort());
        let status = next.status.as_ref().unwrap();
        assert_eq!(status.deploy_id, "2");
        assert!(status.hook_statuses.is_empty());
    }
}
