use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource};
use kube::ResourceExt;

use crate::resources::applications::{AppEnvVar, Application};

pub const PORT_ENV: &str = "PORT";
pub const SVC_DISCOVERY_ENV: &str = "BKPAAS_SERVICE_ADDRESSES_BKSAAS";
const SVC_DISCOVERY_KEY: &str = "bkSaaS";

fn plain(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Merge declared variables, overlay variables and add-on credentials.
///
/// Declared variables come first and keep their positions; an overlay variable with the same
/// name replaces the value in place, new overlay variables are appended. Add-on credentials are
/// appended last and never shadow a name that is already set.
pub fn merge_env<'a>(
    declared: impl IntoIterator<Item = (&'a str, &'a str)>,
    overlay: impl IntoIterator<Item = (&'a str, &'a str)>,
    addons: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = Vec::new();

    for (name, value) in declared {
        if !merged.iter().any(|e| e.name == name) {
            merged.push(plain(name, value));
        }
    }

    for (name, value) in overlay {
        match merged.iter_mut().find(|e| e.name == name) {
            Some(existing) => existing.value = Some(value.into()),
            None => merged.push(plain(name, value)),
        }
    }

    for (name, value) in addons {
        if !merged.iter().any(|e| e.name == name) {
            merged.push(plain(name, value));
        }
    }

    merged
}

/// The environment every container of the application receives
pub fn app_env(app: &Application, addon_credentials: &BTreeMap<String, String>) -> Vec<EnvVar> {
    let declared = app
        .spec
        .configuration
        .env
        .iter()
        .map(|AppEnvVar { name, value }| (name.as_str(), value.as_str()));

    let environment = app.environment();
    let overlay = app
        .spec
        .env_overlay
        .iter()
        .flat_map(|o| o.env_variables.iter())
        .filter(|e| Some(e.env_name.as_str()) == environment)
        .map(|e| (e.name.as_str(), e.value.as_str()));

    let addons = addon_credentials
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()));

    let mut env = merge_env(declared, overlay, addons);

    if let Some(svc_discovery) = svc_discovery_env(app) {
        env.retain(|e| e.name != SVC_DISCOVERY_ENV);
        env.push(svc_discovery);
    }

    env
}

/// Append `PORT` unless the user set it
pub fn with_port(mut env: Vec<EnvVar>, port: i32) -> Vec<EnvVar> {
    if !env.iter().any(|e| e.name == PORT_ENV) {
        env.push(plain(PORT_ENV, &port.to_string()));
    }
    env
}

/// Addresses of the declared SaaS dependencies, published by the discovery service into a ConfigMap
fn svc_discovery_env(app: &Application) -> Option<EnvVar> {
    let config = app.spec.svc_discovery.as_ref()?;
    if config.bk_saas.is_empty() {
        return None;
    }

    Some(EnvVar {
        name: SVC_DISCOVERY_ENV.into(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: format!("svc-disc-results-{}", app.name_any()),
                key: SVC_DISCOVERY_KEY.into(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
    })
}
