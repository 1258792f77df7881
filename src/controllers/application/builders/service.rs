use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{object_meta, proc_service_name, process_labels, process_resource_name, process_selector};
use crate::resources::applications::{Application, Process, ProcService, DEFAULT_TARGET_PORT};
use crate::Result;

pub const EXPOSED_TYPE_ANNOTATION: &str = "paas.dev/exposed-type";
const DEFAULT_SERVICE_PORT: i32 = 80;

fn service(
    app: &Application,
    process: &Process,
    name: String,
    ports: Vec<ServicePort>,
    annotations: Option<BTreeMap<String, String>>,
) -> Result<Service> {
    let mut metadata = object_meta(app, name, process_labels(app, &process.name))?;
    metadata.annotations = annotations;

    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(process_selector(app, &process.name)),
            ports: Some(ports),
            type_: Some("ClusterIP".into()),
            ..Default::default()
        }),
        status: None,
    })
}

fn declared_service(app: &Application, process: &Process, declared: &ProcService) -> Result<Service> {
    let port = ServicePort {
        name: Some(declared.name.clone()),
        port: declared.port.unwrap_or(declared.target_port),
        target_port: Some(IntOrString::Int(declared.target_port)),
        protocol: Some(declared.protocol.clone().unwrap_or_else(|| "TCP".into())),
        ..Default::default()
    };

    let annotations = declared.exposed_type.as_ref().map(|exposed| {
        BTreeMap::from([(EXPOSED_TYPE_ANNOTATION.to_string(), exposed.name.clone())])
    });

    service(
        app,
        process,
        proc_service_name(app, &process.name, &declared.name),
        vec![port],
        annotations,
    )
}

/// One service per process, or with process services enabled, one per declared service
pub fn desired_services(app: &Application) -> Result<Vec<Service>> {
    let mut services = Vec::new();

    for process in &app.spec.processes {
        if app.proc_services_enabled() {
            for declared in process.services.iter().flatten() {
                services.push(declared_service(app, process, declared)?);
            }
            continue;
        }

        let port = ServicePort {
            name: Some("http".into()),
            port: DEFAULT_SERVICE_PORT,
            target_port: Some(IntOrString::Int(
                process.target_port.unwrap_or(DEFAULT_TARGET_PORT),
            )),
            protocol: Some("TCP".into()),
            ..Default::default()
        };
        services.push(service(
            app,
            process,
            process_resource_name(app, &process.name),
            vec![port],
            None,
        )?);
    }

    Ok(services)
}
