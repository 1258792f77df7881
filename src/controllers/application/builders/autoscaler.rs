use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};

use super::{object_meta, process_labels, process_resource_name};
use crate::resources::applications::{Application, AutoscalingSpec, Process};
use crate::Result;

pub const CPU_UTILIZATION_TARGET: i32 = 85;

pub fn build_autoscaler(
    app: &Application,
    process: &Process,
    autoscaling: &AutoscalingSpec,
) -> Result<HorizontalPodAutoscaler> {
    let name = process_resource_name(app, &process.name);

    Ok(HorizontalPodAutoscaler {
        metadata: object_meta(app, name.clone(), process_labels(app, &process.name))?,
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: "Deployment".into(),
                name,
            },
            min_replicas: Some(autoscaling.min_replicas),
            max_replicas: autoscaling.max_replicas,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".into(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".into(),
                    target: MetricTarget {
                        type_: "Utilization".into(),
                        average_utilization: Some(CPU_UTILIZATION_TARGET),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// The fields an autoscaler update is decided on
pub fn autoscaler_bounds(hpa: &HorizontalPodAutoscaler) -> Option<(Option<i32>, i32, Option<i32>)> {
    let spec = hpa.spec.as_ref()?;
    let target = spec
        .metrics
        .iter()
        .flatten()
        .find_map(|m| m.resource.as_ref())
        .and_then(|r| r.target.average_utilization);
    Some((spec.min_replicas, spec.max_replicas, target))
}
