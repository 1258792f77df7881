use std::net::SocketAddr;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use url::Url;

pub use app_operator::{self, telemetry, ReconcilerConfig, State};

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Arguments {
    /// Seconds a pre-release hook pod may run before it is killed
    #[arg(
        long = "hook-running-timeout-secs",
        env = "APP_OPERATOR_HOOK_RUNNING_TIMEOUT_SECS",
        default_value_t = 900
    )]
    hook_running_timeout_secs: u64,

    /// Seconds a failed hook pod is re-observed before the failure becomes terminal
    #[arg(
        long = "hook-failed-grace-secs",
        env = "APP_OPERATOR_HOOK_FAILED_GRACE_SECS",
        default_value_t = 120
    )]
    hook_failed_grace_secs: u64,

    #[arg(
        long = "requeue-after-secs",
        env = "APP_OPERATOR_REQUEUE_AFTER_SECS",
        default_value_t = 5
    )]
    requeue_after_secs: u64,

    #[arg(
        long = "error-requeue-after-secs",
        env = "APP_OPERATOR_ERROR_REQUEUE_AFTER_SECS",
        default_value_t = 30
    )]
    error_requeue_after_secs: u64,

    /// Base URL of the add-on provisioning service
    #[arg(
        long = "addon-service-url",
        env = "APP_OPERATOR_ADDON_SERVICE_URL",
        value_name = "URL"
    )]
    addon_service_url: Option<Url>,

    #[arg(
        long = "addon-timeout-secs",
        env = "APP_OPERATOR_ADDON_TIMEOUT_SECS",
        default_value_t = 10
    )]
    addon_timeout_secs: u64,

    #[arg(
        long = "log-format",
        env = "APP_OPERATOR_LOG_FORMAT",
        value_enum,
        default_value_t = telemetry::LogFormat::Compact
    )]
    log_format: telemetry::LogFormat,

    #[arg(long = "bind", env = "APP_OPERATOR_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

impl Arguments {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            hook_running_timeout: Duration::from_secs(self.hook_running_timeout_secs),
            hook_failed_grace: Duration::from_secs(self.hook_failed_grace_secs),
            requeue_after: Duration::from_secs(self.requeue_after_secs),
            error_requeue_after: Duration::from_secs(self.error_requeue_after_secs),
            addon_service_url: self.addon_service_url.clone(),
            addon_timeout: Duration::from_secs(self.addon_timeout_secs),
        }
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();

    telemetry::init(args.log_format);

    // Initiatilize Kubernetes controller state
    let state = State::new(args.reconciler_config());
    let controller = app_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(args.bind)?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
