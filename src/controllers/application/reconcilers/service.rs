use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams};
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::*;

use super::{namespace, ReconcileResult, Reconciler};
use crate::controllers::application::builders::service::desired_services;
use crate::controllers::application::builders::{children_selector, is_owned_by, RESOURCE_TYPE_PROCESS};
use crate::controllers::application::controller::Context;
use crate::controllers::application::upsert::{delete_ignore_missing, upsert, UpdateDecision};
use crate::resources::applications::Application;
use crate::Result;

/// Converges the network services in front of the processes
pub struct ServiceReconciler;

#[async_trait]
impl Reconciler for ServiceReconciler {
    fn name(&self) -> &'static str {
        "services"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        match converge_services(ctx, app).await {
            Ok(()) => ReconcileResult::proceed(),
            Err(err) => ReconcileResult::with_error(err),
        }
    }
}

type PortKey = (Option<String>, i32, Option<String>, Option<String>);

fn port_keys(service: &Service) -> Vec<PortKey> {
    service
        .spec
        .iter()
        .flat_map(|s| s.ports.iter().flatten())
        .map(|p| {
            let target = p.target_port.as_ref().map(|t| match t {
                IntOrString::Int(i) => i.to_string(),
                IntOrString::String(s) => s.clone(),
            });
            (
                p.name.clone(),
                p.port,
                target,
                Some(p.protocol.clone().unwrap_or_else(|| "TCP".into())),
            )
        })
        .collect()
}

/// Only the port list and the pod selector are owned by this controller
fn update_policy(existing: &Service, desired: &Service) -> UpdateDecision {
    let selector = |s: &Service| s.spec.as_ref().and_then(|s| s.selector.clone()).unwrap_or_default();
    let (live_selector, desired_selector) = (selector(existing), selector(desired));
    if port_keys(existing) == port_keys(desired) && live_selector == desired_selector {
        return UpdateDecision::Skip;
    }

    // a merge patch keeps map keys it does not mention, stale selector keys have to be nulled
    let mut selector_patch: Map<String, Value> = live_selector
        .keys()
        .filter(|k| !desired_selector.contains_key(*k))
        .map(|k| (k.clone(), Value::Null))
        .collect();
    selector_patch.extend(desired_selector.into_iter().map(|(k, v)| (k, Value::String(v))));

    let ports = desired.spec.as_ref().and_then(|s| s.ports.clone());
    UpdateDecision::Patch(json!({
        "spec": {
            "ports": ports,
            "selector": selector_patch,
        }
    }))
}

async fn converge_services(ctx: &Context, app: &Application) -> Result<()> {
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), namespace(app));
    let desired = desired_services(app)?;
    let desired_names: BTreeSet<String> = desired.iter().map(|s| s.name_any()).collect();

    let existing = api
        .list(&ListParams::default().labels(&children_selector(app, RESOURCE_TYPE_PROCESS)))
        .await?;
    for stale in existing
        .items
        .iter()
        .filter(|s| is_owned_by(*s, app) && !desired_names.contains(&s.name_any()))
    {
        info!("Deleting service {} that is no longer declared", stale.name_any());
        delete_ignore_missing(&api, &ctx.metrics, &stale.name_any(), &DeleteParams::default()).await?;
    }

    for service in desired {
        upsert(&api, &ctx.metrics, service, update_policy).await?;
    }
    Ok(())
}
