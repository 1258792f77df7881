//! Reconciliation of `Application` resources into Deployments, Services, autoscalers and hook pods

pub mod builders;
pub mod controller;
pub mod health;
pub mod reconcilers;
pub mod upsert;

#[cfg(test)]
mod fixtures;

pub use controller::{reconcile_app, run, Context};
