use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::resources::applications::{Application, HookType, DEFAULT_DEPLOY_ID};
use crate::{Error, Result};

pub mod autoscaler;
pub mod deployment;
pub mod env;
pub mod pod;
pub mod resolve;
pub mod service;

pub const APP_NAME_LABEL: &str = "paas.dev/app-name";
pub const PROCESS_NAME_LABEL: &str = "paas.dev/process-name";
pub const RESOURCE_TYPE_LABEL: &str = "paas.dev/resource-type";
pub const HOOK_TYPE_LABEL: &str = "paas.dev/hook-type";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "app-operator";

pub const RESOURCE_TYPE_PROCESS: &str = "process";
pub const RESOURCE_TYPE_HOOK: &str = "hook";

pub fn process_resource_name(app: &Application, process: &str) -> String {
    format!("{}--{process}", app.name_any())
}

pub fn proc_service_name(app: &Application, process: &str, service: &str) -> String {
    format!("{}--{process}--{service}", app.name_any())
}

/// The deploy id is free-form, so it is folded into the DNS-1123 alphabet first
pub fn hook_pod_name(app: &Application, hook_type: HookType, deploy_id: &str) -> String {
    let deploy_id: String = deploy_id
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-') => c,
            _ => '-',
        })
        .collect();
    let deploy_id = deploy_id.trim_matches('-');
    let deploy_id = if deploy_id.is_empty() { DEFAULT_DEPLOY_ID } else { deploy_id };
    format!("{}-hook-{}-{deploy_id}", hook_type.as_str(), app.name_any())
}

/// Label selector string matching every child of the application of the given type
pub fn children_selector(app: &Application, resource_type: &str) -> String {
    format!(
        "{APP_NAME_LABEL}={},{RESOURCE_TYPE_LABEL}={resource_type}",
        app.name_any()
    )
}

/// The immutable part of the labels; used as the pod selector of workloads and services
pub fn process_selector(app: &Application, process: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.into(), app.name_any()),
        (PROCESS_NAME_LABEL.into(), process.into()),
    ])
}

pub fn process_labels(app: &Application, process: &str) -> BTreeMap<String, String> {
    let mut labels = process_selector(app, process);
    labels.insert(RESOURCE_TYPE_LABEL.into(), RESOURCE_TYPE_PROCESS.into());
    labels.insert(MANAGED_BY_LABEL.into(), MANAGED_BY.into());
    labels
}

pub fn hook_labels(app: &Application, hook_type: HookType) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.into(), app.name_any()),
        (RESOURCE_TYPE_LABEL.into(), RESOURCE_TYPE_HOOK.into()),
        (HOOK_TYPE_LABEL.into(), hook_type.as_str().into()),
        (MANAGED_BY_LABEL.into(), MANAGED_BY.into()),
    ])
}

/// Metadata for a child object, owned by the application
pub fn object_meta(
    app: &Application,
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
) -> Result<ObjectMeta> {
    let owner_reference = app
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: app.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference]),
        ..Default::default()
    })
}

/// Whether the object is controlled by this application
pub fn is_owned_by<K: Resource>(object: &K, app: &Application) -> bool {
    let Some(uid) = app.meta().uid.as_deref() else {
        return false;
    };
    object
        .meta()
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == uid && o.controller == Some(true))
}
