use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, LocalObjectReference, Pod, PodSpec,
    SecretVolumeSource, Volume, VolumeMount,
};

use super::resolve::{resolve_image, resolve_mounts, resolve_resources};
use super::{hook_labels, hook_pod_name, object_meta};
use crate::resources::applications::{Application, Hook, HookType, Mount, WEB_PROCESS};
use crate::{Error, Result};

pub const IMAGE_PULL_SECRET: &str = "app-image-credentials";

fn volume(mount: &Mount) -> Volume {
    Volume {
        name: mount.name.clone(),
        config_map: mount
            .source
            .config_map
            .as_ref()
            .map(|cm| ConfigMapVolumeSource {
                name: cm.name.clone(),
                ..Default::default()
            }),
        secret: mount.source.secret.as_ref().map(|s| SecretVolumeSource {
            secret_name: Some(s.name.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Attach mounts and pull credentials shared by every pod of the application
pub fn pod_spec(app: &Application, mut container: Container) -> PodSpec {
    let mounts = resolve_mounts(app);

    if !mounts.is_empty() {
        container.volume_mounts = Some(
            mounts
                .iter()
                .map(|m| VolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    ..Default::default()
                })
                .collect(),
        );
    }

    PodSpec {
        containers: vec![container],
        volumes: (!mounts.is_empty()).then(|| mounts.iter().map(volume).collect()),
        image_pull_secrets: app.image_credentials_enabled().then(|| {
            vec![LocalObjectReference {
                name: IMAGE_PULL_SECRET.into(),
            }]
        }),
        ..Default::default()
    }
}

/// The one-shot pod running a hook of the given deploy.
/// Hooks run in the image and with the resources of the `web` process.
pub fn hook_pod(
    app: &Application,
    hook_type: HookType,
    hook: &Hook,
    deploy_id: &str,
    env: Vec<EnvVar>,
) -> Result<Pod> {
    let process = app
        .spec
        .process(WEB_PROCESS)
        .or_else(|| app.spec.processes.first())
        .ok_or_else(|| Error::InvalidProcessConfig {
            process: WEB_PROCESS.into(),
            message: "application has no processes".into(),
        })?;
    let image = resolve_image(app, &process.name)?;

    let container = Container {
        name: hook_type.as_str().into(),
        image: Some(image.image),
        image_pull_policy: Some(image.pull_policy),
        command: (!hook.command.is_empty()).then(|| hook.command.clone()),
        args: (!hook.args.is_empty()).then(|| hook.args.clone()),
        env: (!env.is_empty()).then_some(env),
        resources: Some(resolve_resources(app, process)?),
        ..Default::default()
    };

    let mut spec = pod_spec(app, container);
    spec.restart_policy = Some("Never".into());

    Ok(Pod {
        metadata: object_meta(
            app,
            hook_pod_name(app, hook_type, deploy_id),
            hook_labels(app, hook_type),
        )?,
        spec: Some(spec),
        status: None,
    })
}
