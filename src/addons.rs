use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use url::Url;

use crate::resources::applications::{
    Application, APP_CODE_ANNOTATION, ENVIRONMENT_ANNOTATION, MODULE_NAME_ANNOTATION,
};
use crate::{Error, Result};

/// Who an add-on instance is provisioned for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub code: String,
    pub module: String,
    pub environment: String,
}

impl AppIdentity {
    /// Read the identity annotations; every one of them must be present and non-empty.
    pub fn from_app(app: &Application) -> Result<Self> {
        let annotations = app.annotations();
        let get = |key: &str| -> Result<String> {
            annotations
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::InvalidAnnotations(format!("missing annotation {key}")))
        };

        Ok(Self {
            code: get(APP_CODE_ANNOTATION)?,
            module: get(MODULE_NAME_ANNOTATION)?,
            environment: get(ENVIRONMENT_ANNOTATION)?,
        })
    }
}

/// A provisioned add-on instance
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AddonInstance {
    #[serde(default)]
    pub specs: BTreeMap<String, String>,
}

/// The external service that provisions add-on instances and hands out their credentials
#[async_trait]
pub trait AddonProvisioner: Send + Sync {
    async fn provision(&self, identity: &AppIdentity, addon: &str) -> Result<AddonInstance>;

    /// Credentials are injected into every process container as environment variables
    async fn credentials(
        &self,
        identity: &AppIdentity,
        addon: &str,
    ) -> Result<BTreeMap<String, String>>;
}

pub struct HttpAddonProvisioner {
    base_url: Option<Url>,
    http_client: reqwest::Client,
}

impl HttpAddonProvisioner {
    pub fn new(base_url: Option<Url>) -> Self {
        Self {
            base_url,
            http_client: reqwest::Client::new(),
        }
    }

    fn addon_url(&self, identity: &AppIdentity, addon: &str, action: &str) -> Result<Url> {
        let Some(base_url) = &self.base_url else {
            return Err(Error::AddonProvisionFailed(
                "no add-on service is configured".into(),
            ));
        };

        let path = format!(
            "apps/{}/modules/{}/envs/{}/addons/{addon}/{action}",
            identity.code, identity.module, identity.environment
        );

        Ok(base_url.join(&path)?)
    }
}

#[derive(Deserialize)]
struct CredentialsResponse {
    #[serde(default)]
    credentials: BTreeMap<String, String>,
}

#[async_trait]
impl AddonProvisioner for HttpAddonProvisioner {
    async fn provision(&self, identity: &AppIdentity, addon: &str) -> Result<AddonInstance> {
        self.http_client
            .post(self.addon_url(identity, addon, "provision")?)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Error::AddonApiCall)?
            .error_for_status()
            .map_err(Error::AddonApiCall)?
            .json()
            .await
            .map_err(Error::AddonApiCall)
    }

    async fn credentials(
        &self,
        identity: &AppIdentity,
        addon: &str,
    ) -> Result<BTreeMap<String, String>> {
        let response: CredentialsResponse = self
            .http_client
            .get(self.addon_url(identity, addon, "credentials")?)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Error::AddonApiCall)?
            .error_for_status()
            .map_err(Error::AddonApiCall)?
            .json()
            .await
            .map_err(Error::AddonApiCall)?;

        Ok(response.credentials)
    }
}
