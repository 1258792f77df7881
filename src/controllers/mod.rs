use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use url::Url;

pub mod application;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Timing policy and external endpoints used by the reconcilers
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// A hook pod running for longer than this is deleted and the deploy fails
    pub hook_running_timeout: Duration,
    /// How long a failed hook pod is re-observed before the failure becomes terminal
    pub hook_failed_grace: Duration,
    /// Default delay for "check again later" decisions
    pub requeue_after: Duration,
    /// Delay after a reconcile returned an error
    pub error_requeue_after: Duration,
    /// Base URL of the add-on provisioning service
    pub addon_service_url: Option<Url>,
    /// Bound on every single add-on provisioning call
    pub addon_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            hook_running_timeout: Duration::from_secs(15 * 60),
            hook_failed_grace: Duration::from_secs(2 * 60),
            requeue_after: Duration::from_secs(5),
            error_requeue_after: Duration::from_secs(30),
            addon_service_url: None,
            addon_timeout: Duration::from_secs(10),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    config: ReconcilerConfig,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            config,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
