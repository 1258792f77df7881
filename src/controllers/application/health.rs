use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;

use crate::resources::applications::HealthPhase;

/// Observed health of a single child workload or pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub phase: HealthPhase,
    pub reason: String,
    pub message: String,
}

impl HealthStatus {
    fn new(phase: HealthPhase, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

// Waiting reasons that will not resolve without someone changing the spec or the image
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "InvalidImageName",
];

pub fn deployment_health(deployment: &Deployment) -> HealthStatus {
    let Some(status) = deployment.status.as_ref() else {
        return HealthStatus::new(
            HealthPhase::Progressing,
            "Progressing",
            "waiting for deployment status",
        );
    };

    if status.observed_generation.unwrap_or(0) < deployment.metadata.generation.unwrap_or(0) {
        return HealthStatus::new(
            HealthPhase::Progressing,
            "Progressing",
            "waiting for the rollout to be observed",
        );
    }

    let conditions = status.conditions.as_deref().unwrap_or_default();

    if let Some(failure) = conditions
        .iter()
        .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
    {
        return HealthStatus::new(
            HealthPhase::Unhealthy,
            failure.reason.clone().unwrap_or_else(|| "ReplicaFailure".into()),
            failure.message.clone().unwrap_or_default(),
        );
    }

    if let Some(stuck) = conditions.iter().find(|c| {
        c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
    }) {
        return HealthStatus::new(
            HealthPhase::Unhealthy,
            "ProgressDeadlineExceeded",
            stuck.message.clone().unwrap_or_default(),
        );
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let is_available = conditions
        .iter()
        .any(|c| c.type_ == "Available" && c.status == "True");

    if updated == desired && available == desired && is_available {
        HealthStatus::new(HealthPhase::Healthy, "Available", "")
    } else {
        HealthStatus::new(
            HealthPhase::Progressing,
            "Progressing",
            format!("{updated}/{desired} replicas updated, {available} available"),
        )
    }
}

/// Classify a one-shot pod such as a hook
pub fn pod_health(pod: &Pod) -> HealthStatus {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");

    match phase {
        "Succeeded" => HealthStatus::new(HealthPhase::Healthy, "Succeeded", "pod succeeded"),
        "Failed" => HealthStatus::new(
            HealthPhase::Unhealthy,
            "Failed",
            pod_failure_message(pod).unwrap_or_else(|| {
                pod.status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "pod failed".into())
            }),
        ),
        "Pending" | "Running" => match pod_failure_message(pod) {
            Some(message) => HealthStatus::new(HealthPhase::Unhealthy, "Failed", message),
            None => HealthStatus::new(HealthPhase::Progressing, phase, format!("pod is {}", phase.to_lowercase())),
        },
        other => HealthStatus::new(HealthPhase::Unknown, other, "pod phase is unknown"),
    }
}

pub fn pod_is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

/// Find the direct cause of a failing pod in its container statuses.
/// Pods that are already being deleted never report a cause.
pub fn pod_failure_message(pod: &Pod) -> Option<String> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }

    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find_map(|container| {
            let state = container.state.as_ref()?;
            if let Some(waiting) = &state.waiting {
                let reason = waiting.reason.as_deref().unwrap_or_default();
                if FATAL_WAITING_REASONS.contains(&reason) {
                    return Some(format!(
                        "container {}: {reason}: {}",
                        container.name,
                        waiting.message.as_deref().unwrap_or_default()
                    ));
                }
            }
            if let Some(terminated) = &state.terminated {
                if terminated.exit_code != 0 {
                    return Some(format!(
                        "container {} exited with code {}: {}",
                        container.name,
                        terminated.exit_code,
                        terminated
                            .message
                            .as_deref()
                            .or(terminated.reason.as_deref())
                            .unwrap_or_default()
                    ));
                }
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn condition(type_: &str, status: &str, reason: Option<&str>) -> DeploymentCondition {
        DeploymentCondition {
            type_: type_.into(),
            status: status.into(),
            reason: reason.map(Into::into),
            message: Some(format!("{type_} message")),
            ..Default::default()
        }
    }

    fn deployment(
        generation: i64,
        observed: i64,
        replicas: i32,
        updated: i32,
        available: i32,
        conditions: Vec<DeploymentCondition>,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                updated_replicas: Some(updated),
                available_replicas: Some(available),
                conditions: Some(conditions),
                ..Default::default()
            }),
        }
    }

    fn pod(phase: &str, containers: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.into()),
                container_statuses: Some(containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn waiting(reason: &str) -> ContainerStatus {
        ContainerStatus {
            name: "main".into(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.into()),
                    message: Some("back-off".into()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            name: "main".into(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    reason: Some("Error".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn generation_lag_is_progressing() {
        let d = deployment(3, 2, 1, 1, 1, vec![condition("Available", "True", None)]);
        assert_eq!(deployment_health(&d).phase, HealthPhase::Progressing);
    }

    #[test]
    fn replica_failure_is_unhealthy_with_copied_reason() {
        let d = deployment(
            1,
            1,
            1,
            0,
            0,
            vec![condition("ReplicaFailure", "True", Some("FailedCreate"))],
        );
        let health = deployment_health(&d);
        assert_eq!(health.phase, HealthPhase::Unhealthy);
        assert_eq!(health.reason, "FailedCreate");
        assert_eq!(health.message, "ReplicaFailure message");
    }

    #[test]
    fn progress_deadline_is_unhealthy() {
        let d = deployment(
            1,
            1,
            2,
            1,
            1,
            vec![condition("Progressing", "False", Some("ProgressDeadlineExceeded"))],
        );
        assert_eq!(deployment_health(&d).phase, HealthPhase::Unhealthy);
    }

    #[test]
    fn fully_rolled_out_is_healthy() {
        let d = deployment(
            1,
            1,
            2,
            2,
            2,
            vec![
                condition("Available", "True", Some("MinimumReplicasAvailable")),
                condition("Progressing", "True", Some("NewReplicaSetAvailable")),
            ],
        );
        assert_eq!(deployment_health(&d).phase, HealthPhase::Healthy);

        let partial = deployment(1, 1, 2, 2, 1, vec![condition("Available", "True", None)]);
        let health = deployment_health(&partial);
        assert_eq!(health.phase, HealthPhase::Progressing);
        assert_eq!(health.message, "2/2 replicas updated, 1 available");
    }

    #[test]
    fn pod_phases_map_to_health() {
        assert_eq!(pod_health(&pod("Succeeded", vec![])).phase, HealthPhase::Healthy);
        assert_eq!(pod_health(&pod("Running", vec![])).phase, HealthPhase::Progressing);
        assert_eq!(pod_health(&pod("Pending", vec![])).phase, HealthPhase::Progressing);
        assert_eq!(pod_health(&pod("Unknown", vec![])).phase, HealthPhase::Unknown);

        let failed = pod_health(&pod("Failed", vec![terminated(2)]));
        assert_eq!(failed.phase, HealthPhase::Unhealthy);
        assert!(failed.message.contains("exited with code 2"));

        let pulling = pod_health(&pod("Pending", vec![waiting("ImagePullBackOff")]));
        assert_eq!(pulling.phase, HealthPhase::Unhealthy);
    }

    #[test]
    fn failure_message_ignores_terminating_pods_and_benign_states() {
        assert!(pod_failure_message(&pod("Running", vec![waiting("ContainerCreating")])).is_none());
        assert!(pod_failure_message(&pod("Running", vec![terminated(0)])).is_none());
        assert!(pod_failure_message(&pod("Running", vec![waiting("CrashLoopBackOff")]))
            .unwrap()
            .contains("CrashLoopBackOff"));

        let mut deleting = pod("Running", vec![waiting("CrashLoopBackOff")]);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(pod_failure_message(&deleting).is_none());
    }
}
