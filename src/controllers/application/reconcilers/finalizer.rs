use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::*;

use super::{namespace, ReconcileResult, Reconciler};
use crate::conditions::{self, ConditionStatus, APP_AVAILABLE};
use crate::controllers::application::builders::{
    children_selector, is_owned_by, RESOURCE_TYPE_HOOK, RESOURCE_TYPE_PROCESS,
};
use crate::controllers::application::controller::Context;
use crate::controllers::application::health::pod_is_running;
use crate::controllers::application::upsert::delete_ignore_missing;
use crate::resources::applications::{Application, APPLICATION_FINALIZER};
use crate::Result;

const HOOK_POD_GRACE_PERIOD_SECONDS: u32 = 5;

/// Holds back deletion of an application while one of its hooks runs, then cleans up after it.
///
/// Used instead of the regular pipeline once the application is being deleted.
pub struct FinalizerReconciler;

#[async_trait]
impl Reconciler for FinalizerReconciler {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        match finalize(ctx, app).await {
            Ok(result) => result,
            Err(err) => ReconcileResult::with_error(err),
        }
    }
}

async fn finalize(ctx: &Context, app: &mut Application) -> Result<ReconcileResult> {
    let ns = namespace(app).to_string();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let hook_pods: Vec<Pod> = pods
        .list(&ListParams::default().labels(&children_selector(app, RESOURCE_TYPE_HOOK)))
        .await?
        .items
        .into_iter()
        .filter(|p| is_owned_by(p, app))
        .collect();

    if let Some(running) = hook_pods.iter().find(|p| pod_is_running(p)) {
        info!("Deletion waits for hook pod {}", running.name_any());
        let generation = app.metadata.generation;
        conditions::set(
            &mut app.status_mut().conditions,
            APP_AVAILABLE,
            ConditionStatus::False,
            "Terminating",
            format!("waiting for hook pod {} to finish", running.name_any()),
            generation,
        );
        return Ok(ReconcileResult::requeue(ctx.config.requeue_after));
    }

    let grace = DeleteParams {
        grace_period_seconds: Some(HOOK_POD_GRACE_PERIOD_SECONDS),
        ..Default::default()
    };
    for pod in &hook_pods {
        delete_ignore_missing(&pods, &ctx.metrics, &pod.name_any(), &grace).await?;
    }

    // one by one, a collection delete does not see services created moments ago
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    for service in services
        .list(&ListParams::default().labels(&children_selector(app, RESOURCE_TYPE_PROCESS)))
        .await?
        .items
        .iter()
        .filter(|s| is_owned_by(*s, app))
    {
        delete_ignore_missing(&services, &ctx.metrics, &service.name_any(), &DeleteParams::default())
            .await?;
    }

    let remaining: Vec<String> = app
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != APPLICATION_FINALIZER)
        .cloned()
        .collect();
    let apps: Api<Application> = Api::namespaced(ctx.client.clone(), &ns);
    let patch = json!({
        "metadata": {
            "resourceVersion": app.resource_version(),
            "finalizers": remaining,
        }
    });
    let updated = apps
        .patch(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    app.metadata.finalizers = updated.metadata.finalizers;
    app.metadata.resource_version = updated.metadata.resource_version;

    info!("Cleaned up after {}", app.name_any());
    Ok(ReconcileResult::end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::find;
    use crate::controllers::application::builders::pod::hook_pod;
    use crate::controllers::application::builders::service::desired_services;
    use crate::controllers::application::builders::test_support::app;
    use crate::controllers::application::fixtures::{test_context, FakeApiServer, StubAddons};
    use crate::resources::applications::HookType;

    #[tokio::test]
    async fn running_hook_blocks_deletion_until_it_finishes() {
        let server = FakeApiServer::start();
        let ctx = test_context(&server, StubAddons::default());
        let mut app = app(
            "demo",
            json!({
                "build": {"image": "registry/demo:v1"},
                "processes": [{"name": "web"}],
                "hooks": {"preRelease": {"command": ["migrate"]}}
            }),
        );
        app.metadata.finalizers = Some(vec![APPLICATION_FINALIZER.into()]);
        server.insert(&app);
        let apps: Api<Application> = Api::namespaced(server.client(), "default");
        app = apps.get("demo").await.unwrap();

        let hook = app.spec.pre_release_hook().unwrap().clone();
        server.insert(&hook_pod(&app, HookType::PreRelease, &hook, "1", vec![]).unwrap());
        for service in desired_services(&app).unwrap() {
            server.insert(&service);
        }
        server.modify::<Pod>("default", "pre-release-hook-demo-1", |p| {
            p["status"] = json!({"phase": "Running"});
        });

        let result = FinalizerReconciler.reconcile(&ctx, &mut app).await;

        assert_eq!(result.requeue_after, Some(ctx.config.requeue_after));
        let available = find(&app.status.as_ref().unwrap().conditions, APP_AVAILABLE).unwrap();
        assert_eq!((available.status.as_str(), available.reason.as_str()), ("False", "Terminating"));
        assert_eq!(app.finalizers(), &[APPLICATION_FINALIZER.to_string()]);
        assert_eq!(server.names::<Pod>("default").len(), 1);

        server.modify::<Pod>("default", "pre-release-hook-demo-1", |p| {
            p["status"] = json!({"phase": "Succeeded"});
        });
        let result = FinalizerReconciler.reconcile(&ctx, &mut app).await;

        assert!(result.end && result.err.is_none());
        assert!(server.names::<Pod>("default").is_empty());
        assert!(server.names::<Service>("default").is_empty());
        assert!(apps.get("demo").await.unwrap().finalizers().is_empty());
    }
}
