use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::*;

use super::{ReconcileResult, Reconciler};
use crate::addons::AppIdentity;
use crate::conditions::{self, ConditionStatus, ADDONS_PROVISIONED};
use crate::controllers::application::controller::Context;
use crate::resources::applications::{AddonState, AddonStatus, AppPhase, Application};
use crate::{Error, Result};

/// Makes sure every declared add-on has a provisioned instance
pub struct AddonReconciler;

#[async_trait]
impl Reconciler for AddonReconciler {
    fn name(&self) -> &'static str {
        "addons"
    }

    async fn reconcile(&self, ctx: &Context, app: &mut Application) -> ReconcileResult {
        provision_addons(ctx, app).await
    }
}

fn set_provisioned(app: &mut Application, status: ConditionStatus, reason: &str, message: impl Into<String>) {
    let generation = app.metadata.generation;
    conditions::set(
        &mut app.status_mut().conditions,
        ADDONS_PROVISIONED,
        status,
        reason,
        message,
        generation,
    );
}

async fn provision_one(ctx: &Context, identity: &AppIdentity, addon: &str) -> AddonStatus {
    let outcome = match timeout(ctx.config.addon_timeout, ctx.addons.provision(identity, addon)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::AddonProvisionFailed(format!(
            "provisioning {addon} did not finish within {}s",
            ctx.config.addon_timeout.as_secs()
        ))),
    };

    match outcome {
        Ok(instance) => AddonStatus {
            name: addon.into(),
            state: AddonState::Provisioned,
            specs: instance.specs,
            message: None,
        },
        Err(err) => {
            warn!("Provisioning add-on {addon} failed: {err}");
            AddonStatus {
                name: addon.into(),
                state: AddonState::Failed,
                specs: BTreeMap::new(),
                message: Some(err.to_string()),
            }
        }
    }
}

async fn provision_addons(ctx: &Context, app: &mut Application) -> ReconcileResult {
    if app.spec.addons.is_empty() {
        app.status_mut().addon_statuses.clear();
        set_provisioned(app, ConditionStatus::True, "Provisioned", "no add-ons declared");
        return ReconcileResult::proceed();
    }

    let identity = match AppIdentity::from_app(app) {
        Ok(identity) => identity,
        Err(err) => {
            app.status_mut().phase = AppPhase::Failed;
            set_provisioned(app, ConditionStatus::False, "InvalidAnnotations", err.to_string());
            return ReconcileResult::with_error(err);
        }
    };

    let mut statuses = Vec::with_capacity(app.spec.addons.len());
    for addon in &app.spec.addons {
        statuses.push(provision_one(ctx, &identity, &addon.name).await);
    }

    let failures: Vec<String> = statuses
        .iter()
        .filter(|s| s.state == AddonState::Failed)
        .map(|s| format!("{}: {}", s.name, s.message.as_deref().unwrap_or_default()))
        .collect();
    app.status_mut().addon_statuses = statuses;

    if failures.is_empty() {
        set_provisioned(app, ConditionStatus::True, "Provisioned", "");
        return ReconcileResult::proceed();
    }

    let message = failures.join("; ");
    app.status_mut().phase = AppPhase::Failed;
    set_provisioned(app, ConditionStatus::False, "ProvisionFailed", message.clone());
    ReconcileResult::with_error(Error::AddonProvisionFailed(message))
}

/// Record that the credentials needed to render workloads could not be fetched
pub fn report_credentials_failure(app: &mut Application, err: &Error) {
    warn!("Fetching add-on credentials failed: {err}");
    app.status_mut().phase = AppPhase::Failed;
    set_provisioned(app, ConditionStatus::False, "CredentialsUnavailable", err.to_string());
}

/// Credentials of every declared add-on, merged into one table.
/// When two add-ons hand out the same key, the one declared first wins.
pub async fn addon_credentials(ctx: &Context, app: &Application) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    if app.spec.addons.is_empty() {
        return Ok(merged);
    }

    let identity = AppIdentity::from_app(app)?;
    for addon in &app.spec.addons {
        let credentials = timeout(ctx.config.addon_timeout, ctx.addons.credentials(&identity, &addon.name))
            .await
            .map_err(|_| {
                Error::AddonProvisionFailed(format!(
                    "fetching credentials of {} did not finish within {}s",
                    addon.name,
                    ctx.config.addon_timeout.as_secs()
                ))
            })??;
        for (key, value) in credentials {
            merged.entry(key).or_insert(value);
        }
    }
    Ok(merged)
}
