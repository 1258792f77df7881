use std::fmt::Debug;

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::*;

use crate::{Error, Metrics, Result};

/// What to do with an object that already exists
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDecision {
    /// Leave the live object untouched
    Skip,
    /// Overwrite the live object with the desired one
    Replace,
    /// Send a JSON merge patch
    Patch(Value),
}

/// Create the object if it does not exist, otherwise let `policy` decide how to update it.
pub async fn upsert<K>(
    api: &Api<K>,
    metrics: &Metrics,
    mut desired: K,
    policy: impl FnOnce(&K, &K) -> UpdateDecision,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let Some(existing) = api.get_opt(&name).await? else {
        debug!("Creating {} {name}", K::kind(&()));
        metrics.child_write::<K>("create");
        return Ok(api.create(&PostParams::default(), &desired).await?);
    };

    match policy(&existing, &desired) {
        UpdateDecision::Skip => Ok(existing),
        UpdateDecision::Patch(patch) => {
            debug!("Patching {} {name}", K::kind(&()));
            metrics.child_write::<K>("patch");
            Ok(api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?)
        }
        UpdateDecision::Replace => {
            debug!("Replacing {} {name}", K::kind(&()));
            metrics.child_write::<K>("replace");
            desired.meta_mut().resource_version = existing.resource_version();
            Ok(api.replace(&name, &PostParams::default(), &desired).await?)
        }
    }
}

/// Delete an object, treating an already missing object as success
pub async fn delete_ignore_missing<K>(
    api: &Api<K>,
    metrics: &Metrics,
    name: &str,
    params: &DeleteParams,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    debug!("Ensuring {} {name} does not exist", K::kind(&()));
    metrics.child_write::<K>("delete");
    match api.delete(name, params).await {
        Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(err.into()),
        Ok(_) => Ok(()),
    }
}
