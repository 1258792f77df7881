use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Pod, Service, ServiceSpec};
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher::Config;
use kube::runtime::{reflector, watcher, Predicate, WatchStreamExt};
use kube::Resource;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use super::builders::{MANAGED_BY, MANAGED_BY_LABEL, RESOURCE_TYPE_HOOK, RESOURCE_TYPE_LABEL};
use super::reconcilers::finalizer::FinalizerReconciler;
use super::reconcilers::{namespace, Pipeline, Reconciler};
use crate::addons::{AddonProvisioner, HttpAddonProvisioner};
use crate::controllers::{Diagnostics, ReconcilerConfig, State};
use crate::resources::applications::{Application, APPLICATION_FINALIZER};
use crate::{Error, Metrics, Result};

// Context for our reconciler
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Timeouts and requeue intervals
    pub config: ReconcilerConfig,
    /// Provisions add-on instances and hands out their credentials
    pub addons: Arc<dyn AddonProvisioner>,
    pipeline: Pipeline,
}

impl Context {
    pub fn new(
        client: Client,
        metrics: Metrics,
        state: State,
        addons: Arc<dyn AddonProvisioner>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "app-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            config: state.config,
            addons,
            pipeline: Pipeline::default(),
        })
    }
}

#[instrument(skip(ctx, app))]
async fn reconcile(app: Arc<Application>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure::<Application>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!(
        "Reconciling Application {} in namespace {}",
        app.name_any(),
        namespace(&app)
    );

    let mut working = app.as_ref().clone();
    match reconcile_app(&ctx, &mut working).await {
        Ok(action) => Ok(action),
        Err(err) => {
            // retried on the normal schedule, nothing worth an event
            if !matches!(err, Error::LastHookStillRunning) {
                warn!("reconcile failed: {err}");
                ctx.recorder
                    .publish(
                        &Event {
                            type_: EventType::Warning,
                            reason: "FailedReconcile".into(),
                            note: Some(err.to_string()),
                            action: "Reconcile".into(),
                            secondary: None,
                        },
                        &app.object_ref(&()),
                    )
                    .await?;
            }

            ctx.metrics.reconcile_failure(app.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_app: Arc<Application>, err: &Error, ctx: Arc<Context>) -> Action {
    match err {
        Error::LastHookStillRunning => Action::requeue(ctx.config.requeue_after),
        _ => Action::requeue(ctx.config.error_requeue_after),
    }
}

/// One pass over an application: either the deletion flow or the regular pipeline.
/// The status is written back at most once, and only when it changed.
pub async fn reconcile_app(ctx: &Context, app: &mut Application) -> Result<Action> {
    let observed = app.status.clone();

    let result = if app.metadata.deletion_timestamp.is_some() {
        if !app.finalizers().iter().any(|f| f == APPLICATION_FINALIZER) {
            return Ok(Action::await_change());
        }

        let result = FinalizerReconciler.reconcile(ctx, app).await;
        if result.end && result.err.is_none() {
            // the finalizer is gone, so is the object
            return result.into_action(&ctx.config);
        }
        result
    } else {
        ensure_finalizer(ctx, app).await?;
        ctx.pipeline.run(ctx, app).await
    };

    if app.status != observed {
        persist_status(ctx, app).await?;
    }

    result.into_action(&ctx.config)
}

async fn ensure_finalizer(ctx: &Context, app: &mut Application) -> Result<()> {
    if app.finalizers().iter().any(|f| f == APPLICATION_FINALIZER) {
        return Ok(());
    }

    let mut finalizers = app.finalizers().to_vec();
    finalizers.push(APPLICATION_FINALIZER.into());
    let patch = json!({
        "metadata": {
            "resourceVersion": app.resource_version(),
            "finalizers": finalizers,
        }
    });

    let apps: Api<Application> = Api::namespaced(ctx.client.clone(), namespace(app));
    let updated = apps
        .patch(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    app.metadata.finalizers = updated.metadata.finalizers;
    app.metadata.resource_version = updated.metadata.resource_version;
    Ok(())
}

async fn persist_status(ctx: &Context, app: &mut Application) -> Result<()> {
    let Some(status) = app.status.as_ref() else {
        return Ok(());
    };

    let mut status = serde_json::to_value(status)?;
    // owned by the domain reconciler
    if let Some(fields) = status.as_object_mut() {
        fields.remove("addresses");
    }

    let patch = json!({
        "metadata": {"resourceVersion": app.resource_version()},
        "status": status,
    });
    let apps: Api<Application> = Api::namespaced(ctx.client.clone(), namespace(app));
    let updated = apps
        .patch_status(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    app.metadata.resource_version = updated.metadata.resource_version;
    Ok(())
}

// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");
    let metrics = Metrics::default().register(&state.registry).unwrap();

    let apps = Api::<Application>::all(client.clone());
    if let Err(e) = apps.list(&ListParams::default().limit(1)).await {
        error!("Application is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all resources we create have this label
    let managed = format!("{MANAGED_BY_LABEL}={MANAGED_BY}");
    let cfg = Config::default().labels(&managed);
    // the only pods we own directly are hook pods
    let hook_cfg = Config::default().labels(&format!(
        "{managed},{RESOURCE_TYPE_LABEL}={RESOURCE_TYPE_HOOK}"
    ));

    let (app_store, app_writer) = reflector::store();
    let app_reflector = reflector(app_writer, watcher(apps, Config::default()))
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .default_backoff()
        // our own status writes must not trigger another pass
        .predicate_filter(application_predicate);

    let deploy_watcher = watcher(Api::<Deployment>::all(client.clone()), cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(status_predicate_serde));

    let pod_watcher = watcher(Api::<Pod>::all(client.clone()), hook_cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate.combine(pod_phase_predicate));

    let svc_watcher = watcher(Api::<Service>::all(client.clone()), cfg.clone())
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        // svc has no generation so we hash the spec to check for changes
        .predicate_filter(changed_predicate.combine(spec_predicate_serde));

    let hpa_watcher = watcher(Api::<HorizontalPodAutoscaler>::all(client.clone()), cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    let addons = Arc::new(HttpAddonProvisioner::new(
        state.config.addon_service_url.clone(),
    ));

    Controller::for_stream(app_reflector, app_store)
        .shutdown_on_signal()
        .owns_stream(deploy_watcher)
        .owns_stream(pod_watcher)
        .owns_stream(svc_watcher)
        .owns_stream(hpa_watcher)
        .run(
            reconcile,
            error_policy,
            Context::new(client, metrics, state, addons),
        )
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}

/// The deploy id arrives as an annotation, and deletion and finalizers only show up in metadata
fn application_predicate(app: &Application) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    changed_predicate(app).hash(&mut hasher);
    app.meta().deletion_timestamp.is_some().hash(&mut hasher);
    app.finalizers().hash(&mut hasher);
    Some(hasher.finish())
}

fn pod_phase_predicate(pod: &Pod) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .hash(&mut hasher);
    Some(hasher.finish())
}

trait MyHasStatus {
    type Status;

    fn status(&self) -> Option<&Self::Status>;
}

impl MyHasStatus for Deployment {
    type Status = DeploymentStatus;

    fn status(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

fn status_predicate_serde<K: Resource + MyHasStatus>(obj: &K) -> Option<u64>
where
    K::Status: Serialize,
{
    let mut hasher = DefaultHasher::new();
    if let Some(s) = obj.status() {
        serde_hashkey::to_key(s)
            .expect("serde_hashkey never to return an error")
            .hash(&mut hasher);
    }
    Some(hasher.finish())
}

trait MyHasSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl MyHasSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

fn spec_predicate_serde<K: Resource + MyHasSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec())
        .expect("serde_hashkey never to return an error")
        .hash(&mut hasher);
    Some(hasher.finish())
}
