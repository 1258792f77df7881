use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Probe;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static APPLICATION_FINALIZER: &str = "applications.paas.dev";

/// Identifier of the deploy action that produced the current spec
pub const DEPLOY_ID_ANNOTATION: &str = "paas.dev/deploy-id";
/// JSON table `{process: {image, policy}}` that takes precedence over `spec.build`
pub const LEGACY_PROC_IMAGE_ANNOTATION: &str = "paas.dev/legacy-proc-image-config";
/// JSON table `{process: {cpu, memory}}` that takes precedence over `resQuotaPlan`
pub const LEGACY_PROC_RES_ANNOTATION: &str = "paas.dev/legacy-proc-res-config";
pub const PROC_SERVICES_FEATURE_ANNOTATION: &str = "paas.dev/proc-services-feature-enabled";
pub const ENVIRONMENT_ANNOTATION: &str = "paas.dev/environment";
pub const IMAGE_CREDENTIALS_ANNOTATION: &str = "paas.dev/image-credentials";
pub const APP_CODE_ANNOTATION: &str = "paas.dev/app-code";
pub const MODULE_NAME_ANNOTATION: &str = "paas.dev/module-name";
/// Set on a child Deployment to stop the operator from updating it in place
pub const SKIP_UPDATE_ANNOTATION: &str = "paas.dev/skip-update";
/// Written on child Deployments; holds the application snapshot they were last rendered from
pub const LAST_SYNCED_SERIALIZED_APP_ANNOTATION: &str = "paas.dev/last-synced-serialized-app";

pub const DEFAULT_DEPLOY_ID: &str = "1";
pub const WEB_PROCESS: &str = "web";
pub const MAX_REPLICAS: i32 = 20;
pub const DEFAULT_TARGET_PORT: i32 = 5000;
pub const DEFAULT_RES_QUOTA_PLAN: &str = "default";
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
pub const DEFAULT_AUTOSCALING_POLICY: &str = "default";

/// An Application declares an image, its processes and everything that should run alongside them.
/// The operator maintains one Deployment per process, their Services, autoscalers and the
/// pre-release hook Pod of the current deploy.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Application",
    group = "paas.dev",
    version = "v1alpha2",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Deploy", "type":"string", "jsonPath":".status.deployId"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"AppAvailable\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ApplicationStatus", shortname = "app")]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,

    /// Processes of the application; exactly one of them is named `web`
    pub processes: Vec<Process>,

    #[serde(default)]
    pub configuration: AppConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<Addon>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<AppHooks>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svc_discovery: Option<SvcDiscConfig>,

    /// Per-environment overrides, selected by the `paas.dev/environment` annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_overlay: Option<EnvOverlay>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0, max = 20))]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1, max = 65535))]
    pub target_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_quota_plan: Option<String>,

    /// Network services of this process; only honoured with `paas.dev/proc-services-feature-enabled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ProcService>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbeSet>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcService {
    pub name: String,
    pub target_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_type: Option<ExposedType>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExposedType {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingSpec {
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ProbeSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Probe>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<AppEnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AppEnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Addon {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub name: String,
    pub mount_path: String,
    pub source: MountSource,
}

/// Exactly one source must be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<NamedSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<NamedSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NamedSource {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<Hook>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Hook {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SvcDiscConfig {
    #[serde(default, rename = "bkSaaS")]
    pub bk_saas: Vec<SaaSReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaaSReference {
    pub bk_app_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvOverlay {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ReplicasOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_variables: Vec<EnvVarOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub autoscaling: Vec<AutoscalingOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub res_quotas: Vec<ResQuotaOverlay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountOverlay>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasOverlay {
    pub env_name: String,
    pub process: String,
    pub count: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarOverlay {
    pub env_name: String,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingOverlay {
    pub env_name: String,
    pub process: String,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResQuotaOverlay {
    pub env_name: String,
    pub process: String,
    pub plan: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountOverlay {
    pub env_name: String,
    pub name: String,
    pub mount_path: String,
    pub source: MountSource,
}

/// Status of the Application
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub phase: AppPhase,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The generation observed by the controller
    #[serde(default)]
    pub observed_generation: i64,

    /// The deploy id the current status was computed for
    #[serde(default)]
    pub deploy_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<Time>,

    #[serde(default)]
    pub hook_statuses: Vec<HookStatus>,

    #[serde(default)]
    pub addon_statuses: Vec<AddonStatus>,

    /// Written by the domain reconciler, never by this operator
    #[serde(default)]
    pub addresses: Vec<Addressable>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AppPhase {
    #[default]
    Pending,
    Running,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum HealthPhase {
    Healthy,
    Unhealthy,
    Progressing,
    #[default]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum HookType {
    #[default]
    #[serde(rename = "pre-release")]
    PreRelease,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreRelease => "pre-release",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    #[serde(rename = "type")]
    pub type_: HookType,
    #[serde(default)]
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default)]
    pub phase: HealthPhase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AddonState {
    #[default]
    Pending,
    Provisioned,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AddonStatus {
    pub name: String,
    #[serde(default)]
    pub state: AddonState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub specs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Addressable {
    pub source_type: String,
    pub url: String,
}

impl Application {
    /// The deploy id requested through annotations, falling back to [`DEFAULT_DEPLOY_ID`]
    pub fn deploy_id(&self) -> String {
        self.annotations()
            .get(DEPLOY_ID_ANNOTATION)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_DEPLOY_ID.to_string())
    }

    pub fn environment(&self) -> Option<&str> {
        self.annotations()
            .get(ENVIRONMENT_ANNOTATION)
            .map(String::as_str)
            .filter(|env| !env.is_empty())
    }

    pub fn proc_services_enabled(&self) -> bool {
        annotation_is_true(self, PROC_SERVICES_FEATURE_ANNOTATION)
    }

    pub fn image_credentials_enabled(&self) -> bool {
        annotation_is_true(self, IMAGE_CREDENTIALS_ANNOTATION)
    }

    pub fn status_mut(&mut self) -> &mut ApplicationStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn hook_status(&self, hook_type: HookType) -> Option<&HookStatus> {
        self.status.as_ref().and_then(|s| s.hook_status(hook_type))
    }
}

fn annotation_is_true(app: &Application, key: &str) -> bool {
    app.annotations()
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

impl ApplicationStatus {
    pub fn hook_status(&self, hook_type: HookType) -> Option<&HookStatus> {
        self.hook_statuses.iter().find(|h| h.type_ == hook_type)
    }

    /// Replace the status of the hook with the same type, or append it
    pub fn set_hook_status(&mut self, status: HookStatus) {
        match self
            .hook_statuses
            .iter_mut()
            .find(|h| h.type_ == status.type_)
        {
            Some(existing) => *existing = status,
            None => self.hook_statuses.push(status),
        }
    }
}

impl ApplicationSpec {
    pub fn process(&self, name: &str) -> Option<&Process> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn pre_release_hook(&self) -> Option<&Hook> {
        self.hooks.as_ref().and_then(|h| h.pre_release.as_ref())
    }

    /// Fill in the values the admission webhook defaults, so that a spec written by an older
    /// operator can be compared against one written today.
    pub fn default_fill(&mut self) {
        if let Some(build) = self.build.as_mut() {
            build
                .image_pull_policy
                .get_or_insert_with(|| DEFAULT_IMAGE_PULL_POLICY.to_string());
        }

        for process in &mut self.processes {
            process.replicas.get_or_insert(1);
            process.target_port.get_or_insert(DEFAULT_TARGET_PORT);
            process
                .res_quota_plan
                .get_or_insert_with(|| DEFAULT_RES_QUOTA_PLAN.to_string());

            if let Some(autoscaling) = process.autoscaling.as_mut() {
                autoscaling
                    .policy
                    .get_or_insert_with(|| DEFAULT_AUTOSCALING_POLICY.to_string());
            }

            for service in process.services.iter_mut().flatten() {
                service.protocol.get_or_insert_with(|| "TCP".to_string());
                service.port.get_or_insert(service.target_port);
            }
        }

        if let Some(overlay) = self.env_overlay.as_mut() {
            for autoscaling in &mut overlay.autoscaling {
                autoscaling
                    .policy
                    .get_or_insert_with(|| DEFAULT_AUTOSCALING_POLICY.to_string());
            }
        }
    }
}
