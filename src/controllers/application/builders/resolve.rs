use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use regex::Regex;

use crate::resources::applications::{
    Application, AutoscalingOverlay, AutoscalingSpec, EnvOverlay, Mount, Process,
    ReplicasOverlay, ResQuotaOverlay, DEFAULT_IMAGE_PULL_POLICY, LEGACY_PROC_IMAGE_ANNOTATION,
    LEGACY_PROC_RES_ANNOTATION, MAX_REPLICAS,
};
use crate::{Error, Result};

/// `{process: {key: value}}` tables carried by the legacy annotations
type LegacyTable = BTreeMap<String, BTreeMap<String, String>>;

fn legacy_entry(
    app: &Application,
    annotation: &str,
    process: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    let Some(raw) = app.annotations().get(annotation) else {
        return Ok(None);
    };
    let mut table: LegacyTable = serde_json::from_str(raw)
        .map_err(|err| Error::InvalidAnnotations(format!("{annotation}: {err}")))?;
    Ok(table.remove(process))
}

pub fn validate_process_name(name: &str) -> Result<()> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]){1,11}$").unwrap());

    if regex.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidProcessConfig {
            process: name.into(),
            message: "process name must be 2-12 lowercase alphanumerics or '-'".into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub image: String,
    pub pull_policy: String,
}

/// The legacy per-process image annotation wins over `spec.build`
pub fn resolve_image(app: &Application, process: &str) -> Result<ResolvedImage> {
    if let Some(mut legacy) = legacy_entry(app, LEGACY_PROC_IMAGE_ANNOTATION, process)? {
        if let Some(image) = legacy.remove("image").filter(|i| !i.is_empty()) {
            return Ok(ResolvedImage {
                image,
                pull_policy: legacy
                    .remove("policy")
                    .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.into()),
            });
        }
    }

    let build = app.spec.build.as_ref();
    match build.and_then(|b| b.image.clone()).filter(|i| !i.is_empty()) {
        Some(image) => Ok(ResolvedImage {
            image,
            pull_policy: build
                .and_then(|b| b.image_pull_policy.clone())
                .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.into()),
        }),
        None => Err(Error::InvalidProcessConfig {
            process: process.into(),
            message: "no image configured".into(),
        }),
    }
}

struct Plan {
    limit_cpu: &'static str,
    limit_memory: &'static str,
    request_cpu: &'static str,
    request_memory: &'static str,
}

fn plan(name: &str) -> Option<Plan> {
    let plan = match name {
        "default" | "4C1G" => Plan {
            limit_cpu: "4000m",
            limit_memory: "1024Mi",
            request_cpu: "200m",
            request_memory: "256Mi",
        },
        "4C2G" => Plan {
            limit_cpu: "4000m",
            limit_memory: "2048Mi",
            request_cpu: "200m",
            request_memory: "1024Mi",
        },
        "4C4G" => Plan {
            limit_cpu: "4000m",
            limit_memory: "4096Mi",
            request_cpu: "200m",
            request_memory: "2048Mi",
        },
        _ => return None,
    };
    Some(plan)
}

fn cpu_memory(cpu: impl Into<String>, memory: impl Into<String>) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".into(), Quantity(cpu.into())),
        ("memory".into(), Quantity(memory.into())),
    ])
}

/// The legacy per-process resource annotation wins over the quota plan
pub fn resolve_resources(app: &Application, process: &Process) -> Result<ResourceRequirements> {
    if let Some(mut legacy) = legacy_entry(app, LEGACY_PROC_RES_ANNOTATION, &process.name)? {
        if let (Some(cpu), Some(memory)) = (legacy.remove("cpu"), legacy.remove("memory")) {
            let limits = cpu_memory(cpu, memory);
            return Ok(ResourceRequirements {
                requests: Some(limits.clone()),
                limits: Some(limits),
                ..Default::default()
            });
        }
    }

    let plan_name = overlay_entry(app, overlay(app).map(|o| &o.res_quotas), &process.name)
        .map(|e| e.plan.clone())
        .or_else(|| process.res_quota_plan.clone())
        .ok_or_else(|| Error::InvalidProcessConfig {
            process: process.name.clone(),
            message: "no resource quota configured".into(),
        })?;

    let Some(plan) = plan(&plan_name) else {
        return Err(Error::InvalidProcessConfig {
            process: process.name.clone(),
            message: format!("unknown resource quota plan {plan_name}"),
        });
    };

    Ok(ResourceRequirements {
        limits: Some(cpu_memory(plan.limit_cpu, plan.limit_memory)),
        requests: Some(cpu_memory(plan.request_cpu, plan.request_memory)),
        ..Default::default()
    })
}

/// Overlay entries scoped to one process of one environment
trait ProcessOverlay {
    fn env_name(&self) -> &str;
    fn process(&self) -> &str;
}

macro_rules! process_overlay {
    ($($ty:ty),*) => {
        $(impl ProcessOverlay for $ty {
            fn env_name(&self) -> &str {
                &self.env_name
            }
            fn process(&self) -> &str {
                &self.process
            }
        })*
    };
}

process_overlay!(ReplicasOverlay, ResQuotaOverlay, AutoscalingOverlay);

fn overlay_entry<'a, T: ProcessOverlay>(
    app: &Application,
    entries: Option<&'a Vec<T>>,
    process: &str,
) -> Option<&'a T> {
    let env = app.environment()?;
    entries?
        .iter()
        .find(|e| e.env_name() == env && e.process() == process)
}

fn overlay(app: &Application) -> Option<&EnvOverlay> {
    app.spec.env_overlay.as_ref()
}

/// Overlay for the current environment, else the process, else one; clamped to the global maximum
pub fn resolve_replicas(app: &Application, process: &Process) -> i32 {
    overlay_entry(app, overlay(app).map(|o| &o.replicas), &process.name)
        .map(|e| e.count)
        .or(process.replicas)
        .unwrap_or(1)
        .clamp(0, MAX_REPLICAS)
}

/// Autoscaling is enabled when the overlay or the process declares it
pub fn resolve_autoscaling(app: &Application, process: &Process) -> Option<AutoscalingSpec> {
    overlay_entry(app, overlay(app).map(|o| &o.autoscaling), &process.name)
        .map(|e| AutoscalingSpec {
            min_replicas: e.min_replicas,
            max_replicas: e.max_replicas,
            policy: e.policy.clone(),
        })
        .or_else(|| process.autoscaling.clone())
        .map(|mut spec| {
            spec.max_replicas = spec.max_replicas.clamp(1, MAX_REPLICAS);
            spec.min_replicas = spec.min_replicas.clamp(1, spec.max_replicas);
            spec
        })
}

/// Base mounts plus the current environment's overlay mounts; overlay entries replace base ones by name
pub fn resolve_mounts(app: &Application) -> Vec<Mount> {
    let mut mounts = app.spec.mounts.clone();

    let (Some(env), Some(overlay)) = (app.environment(), app.spec.env_overlay.as_ref()) else {
        return mounts;
    };

    for entry in overlay.mounts.iter().filter(|m| m.env_name == env) {
        let mount = Mount {
            name: entry.name.clone(),
            mount_path: entry.mount_path.clone(),
            source: entry.source.clone(),
        };
        match mounts.iter_mut().find(|m| m.name == mount.name) {
            Some(existing) => *existing = mount,
            None => mounts.push(mount),
        }
    }

    mounts
}
