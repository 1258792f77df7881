use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Object is missing key: {0}")]
    MissingObjectKey(&'static str),

    #[error("The hook pod {0} already exists")]
    HookPodExists(String),

    #[error("The hook pod {pod} timed out after {}s", elapsed.as_secs())]
    HookTimeout { pod: String, elapsed: Duration },

    #[error("The hook pod {pod} ended unsuccessfully: {message}")]
    HookFailed { pod: String, message: String },

    #[error("The hook of the last deploy is still running")]
    LastHookStillRunning,

    #[error("Invalid annotations: {0}")]
    InvalidAnnotations(String),

    #[error("Invalid configuration for process {process}: {message}")]
    InvalidProcessConfig { process: String, message: String },

    #[error("Add-on provisioning failed: {0}")]
    AddonProvisionFailed(String),

    #[error("Failed to make add-on service API call: {0}")]
    AddonApiCall(reqwest::Error),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::HookPodExists(_) => "HookPodExists",
            Error::HookTimeout { .. } => "HookTimeout",
            Error::HookFailed { .. } => "HookFailed",
            Error::LastHookStillRunning => "LastHookStillRunning",
            Error::InvalidAnnotations(_) => "InvalidAnnotations",
            Error::InvalidProcessConfig { .. } => "InvalidProcessConfig",
            Error::AddonProvisionFailed(_) => "AddonProvisionFailed",
            Error::AddonApiCall(_) => "AddonApiCall",
            Error::InvalidUrl(_) => "InvalidUrl",
        }
    }
}

/// External add-on provisioning
pub mod addons;

/// Condition list helpers
pub mod conditions;

pub mod controllers;
pub use controllers::application::run;
pub use controllers::{ReconcilerConfig, State};

/// Log integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources
pub mod resources;
