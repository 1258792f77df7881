use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::env::with_port;
use super::pod::pod_spec;
use super::resolve::{resolve_image, resolve_replicas, resolve_resources, validate_process_name};
use super::{object_meta, process_labels, process_resource_name, process_selector};
use crate::resources::applications::{
    Application, ApplicationSpec, Process, DEFAULT_TARGET_PORT, DEPLOY_ID_ANNOTATION,
    LAST_SYNCED_SERIALIZED_APP_ANNOTATION,
};
use crate::Result;

const KUBECTL_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// What a workload was rendered from, stored on the workload itself
#[derive(Serialize, Deserialize)]
struct Snapshot<S> {
    annotations: BTreeMap<String, String>,
    spec: S,
}

fn relevant_annotations(app: &Application) -> BTreeMap<String, String> {
    app.annotations()
        .iter()
        .filter(|(k, _)| k.as_str() != DEPLOY_ID_ANNOTATION && k.as_str() != KUBECTL_LAST_APPLIED)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn serialized_snapshot(app: &Application) -> Result<String> {
    Ok(serde_json::to_string(&Snapshot {
        annotations: relevant_annotations(app),
        spec: &app.spec,
    })?)
}

/// Whether the workload was rendered from an application equivalent to the current one.
///
/// The stored snapshot is first compared as written. If that fails it is read back into the
/// current schema, defaulted, and compared again, so that fields introduced after the snapshot
/// was written do not count as a change.
pub fn snapshot_matches(app: &Application, deployment: &Deployment) -> bool {
    let Some(stored) = deployment
        .annotations()
        .get(LAST_SYNCED_SERIALIZED_APP_ANNOTATION)
    else {
        return false;
    };

    let Ok(stored) = serde_json::from_str::<Snapshot<Value>>(stored) else {
        return false;
    };

    let annotations = relevant_annotations(app);
    if stored.annotations != annotations {
        return false;
    }

    match serde_json::to_value(&app.spec) {
        Ok(current) if current == stored.spec => return true,
        _ => {}
    }

    let Ok(mut stored_spec) = serde_json::from_value::<ApplicationSpec>(stored.spec) else {
        return false;
    };
    stored_spec.default_fill();
    stored_spec == app.spec
}

pub fn build_deployment(app: &Application, process: &Process, env: Vec<EnvVar>) -> Result<Deployment> {
    validate_process_name(&process.name)?;

    let image = resolve_image(app, &process.name)?;
    let target_port = process.target_port.unwrap_or(DEFAULT_TARGET_PORT);
    let labels = process_labels(app, &process.name);

    let container = Container {
        name: process.name.clone(),
        image: Some(image.image),
        image_pull_policy: Some(image.pull_policy),
        command: (!process.command.is_empty()).then(|| process.command.clone()),
        args: (!process.args.is_empty()).then(|| process.args.clone()),
        env: Some(with_port(env, target_port)),
        ports: Some(vec![ContainerPort {
            container_port: target_port,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
        resources: Some(resolve_resources(app, process)?),
        liveness_probe: process.probes.as_ref().and_then(|p| p.liveness.clone()),
        readiness_probe: process.probes.as_ref().and_then(|p| p.readiness.clone()),
        startup_probe: process.probes.as_ref().and_then(|p| p.startup.clone()),
        ..Default::default()
    };

    let mut metadata = object_meta(
        app,
        process_resource_name(app, &process.name),
        labels.clone(),
    )?;
    metadata.annotations = Some(BTreeMap::from([(
        LAST_SYNCED_SERIALIZED_APP_ANNOTATION.into(),
        serialized_snapshot(app)?,
    )]));

    Ok(Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(resolve_replicas(app, process)),
            selector: LabelSelector {
                match_labels: Some(process_selector(app, &process.name)),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec(app, container)),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::application::builders::test_support::{app, with_annotation};
    use crate::resources::applications::{ENVIRONMENT_ANNOTATION, IMAGE_CREDENTIALS_ANNOTATION};
    use crate::Error;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    fn demo() -> Application {
        app(
            "demo",
            json!({
                "build": {"image": "registry/demo:v1"},
                "processes": [
                    {"name": "web", "replicas": 2, "targetPort": 8000, "command": ["gunicorn"]},
                    {"name": "worker", "command": ["celery"]}
                ]
            }),
        )
    }

    #[test]
    fn builds_process_deployment() {
        let app = with_annotation(demo(), IMAGE_CREDENTIALS_ANNOTATION, "true");
        let web = app.spec.process("web").unwrap();
        let deployment = build_deployment(&app, web, vec![]).unwrap();

        assert_json_include!(
            actual: serde_json::to_value(&deployment).unwrap(),
            expected: json!({
                "metadata": {
                    "name": "demo--web",
                    "namespace": "default",
                    "labels": {
                        "paas.dev/app-name": "demo",
                        "paas.dev/process-name": "web",
                        "paas.dev/resource-type": "process",
                        "app.kubernetes.io/managed-by": "app-operator"
                    },
                    "ownerReferences": [{"kind": "Application", "name": "demo", "controller": true}]
                },
                "spec": {
                    "replicas": 2,
                    "selector": {"matchLabels": {"paas.dev/app-name": "demo", "paas.dev/process-name": "web"}},
                    "template": {
                        "metadata": {"labels": {"paas.dev/process-name": "web"}},
                        "spec": {
                            "imagePullSecrets": [{"name": "app-image-credentials"}],
                            "containers": [{
                                "name": "web",
                                "image": "registry/demo:v1",
                                "imagePullPolicy": "IfNotPresent",
                                "command": ["gunicorn"],
                                "env": [{"name": "PORT", "value": "8000"}],
                                "ports": [{"containerPort": 8000}],
                                "resources": {"limits": {"cpu": "4000m", "memory": "1024Mi"}}
                            }]
                        }
                    }
                }
            })
        );
        assert!(snapshot_matches(&app, &deployment));
    }

    #[test]
    fn invalid_process_name_is_rejected() {
        let mut app = demo();
        app.spec.processes[1].name = "Worker_1".into();
        let worker = app.spec.processes[1].clone();
        assert!(matches!(
            build_deployment(&app, &worker, vec![]),
            Err(Error::InvalidProcessConfig { .. })
        ));
    }

    fn rendered(app: &Application) -> Deployment {
        build_deployment(app, app.spec.process("web").unwrap(), vec![]).unwrap()
    }

    #[test]
    fn snapshot_ignores_deploy_id() {
        let deployment = rendered(&with_annotation(demo(), DEPLOY_ID_ANNOTATION, "1"));
        let next = with_annotation(demo(), DEPLOY_ID_ANNOTATION, "2");
        assert!(snapshot_matches(&next, &deployment));
    }

    #[test]
    fn snapshot_detects_spec_and_annotation_changes() {
        let deployment = rendered(&demo());

        let mut scaled = demo();
        scaled.spec.processes[0].replicas = Some(3);
        assert!(!snapshot_matches(&scaled, &deployment));

        let moved = with_annotation(demo(), ENVIRONMENT_ANNOTATION, "prod");
        assert!(!snapshot_matches(&moved, &deployment));
    }

    #[test]
    fn snapshot_written_before_defaults_still_matches() {
        let app = demo();
        let mut deployment = rendered(&app);

        // a snapshot written before `resQuotaPlan` and `imagePullPolicy` existed
        let mut old_spec = serde_json::to_value(&app.spec).unwrap();
        for process in old_spec["processes"].as_array_mut().unwrap() {
            process.as_object_mut().unwrap().remove("resQuotaPlan");
        }
        old_spec["build"]
            .as_object_mut()
            .unwrap()
            .remove("imagePullPolicy");
        let old = json!({"annotations": {}, "spec": old_spec}).to_string();
        deployment
            .annotations_mut()
            .insert(LAST_SYNCED_SERIALIZED_APP_ANNOTATION.into(), old);

        assert!(snapshot_matches(&app, &deployment));
    }

    #[test]
    fn missing_or_garbled_snapshot_never_matches() {
        let app = demo();
        let mut deployment = rendered(&app);
        deployment
            .annotations_mut()
            .insert(LAST_SYNCED_SERIALIZED_APP_ANNOTATION.into(), "{".into());
        assert!(!snapshot_matches(&app, &deployment));

        deployment
            .annotations_mut()
            .remove(LAST_SYNCED_SERIALIZED_APP_ANNOTATION);
        assert!(!snapshot_matches(&app, &deployment));
    }
}
