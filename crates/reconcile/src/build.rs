//! Build controller pieces: lifecycle validation, staging hand-off and the
//! retention cleaner that prunes superseded successful builds per app.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use keel_core::{
    conditions::{self, Condition, FAILED, STAGING, SUCCEEDED},
    App, Build, LifecycleType, OwnerRef, Package, PackageType, Resource, ResourceState,
};
use keel_store::ScopedClient;
use tracing::{debug, info};

use crate::{Cleaner, Delegate, Outcome};

const RETENTION_ENV: &str = "KEEL_BUILD_RETENTION";
const DEFAULT_RETENTION: usize = 5;

/// What actually stages a build (runs the buildpack pipeline or resolves a
/// docker image). One `stage` call per reconcile pass; the backend reports
/// where the work stands.
#[async_trait]
pub trait StagingBackend: Send + Sync {
    async fn stage(&self, build: &Build) -> anyhow::Result<StagingOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingOutcome {
    Running,
    Completed,
    Failed { reason: String },
}

fn expected_lifecycle(package_type: PackageType) -> LifecycleType {
    match package_type {
        PackageType::Bits => LifecycleType::Buildpack,
        PackageType::Docker => LifecycleType::Docker,
    }
}

pub struct BuildDelegate {
    backend: Arc<dyn StagingBackend>,
}

impl BuildDelegate {
    pub fn new(backend: Arc<dyn StagingBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<C: ScopedClient> Delegate<C> for BuildDelegate {
    type Obj = Build;
    type Deps = (App, Package);

    fn cleanup_owner(&self, obj: &Build) -> Option<OwnerRef> {
        Some(OwnerRef { kind: App::KIND.to_string(), name: obj.spec.app_ref.clone() })
    }

    fn terminal_condition(&self) -> &'static str {
        SUCCEEDED
    }

    async fn dependencies(&self, client: &C, obj: &Build) -> anyhow::Result<Self::Deps> {
        let partition = &obj.metadata.partition;
        let app: App =
            client.get(partition, &obj.spec.app_ref).await.context("fetching app")?;
        let package: Package =
            client.get(partition, &obj.spec.package_ref).await.context("fetching package")?;
        Ok((app, package))
    }

    fn validate(&self, obj: &Build, (app, package): &Self::Deps) -> Result<(), String> {
        let expected = expected_lifecycle(package.spec.type_);
        if obj.spec.lifecycle.type_ != expected {
            return Err(format!(
                "cannot build {} package with {} build",
                package.spec.type_, obj.spec.lifecycle.type_
            ));
        }
        if app.spec.lifecycle.type_ != expected {
            return Err(format!(
                "cannot build {} package for {} app",
                package.spec.type_, app.spec.lifecycle.type_
            ));
        }
        Ok(())
    }

    fn mark_validation_failed(&self, obj: &mut Build, message: &str) {
        let generation = obj.metadata.generation;
        let conds = &mut obj.status.conditions;
        conditions::set(
            conds,
            Condition::new(STAGING, false, "BuildNotRunning", "")
                .with_observed_generation(generation),
        );
        conditions::set(
            conds,
            Condition::new(SUCCEEDED, false, "BuildFailed", message)
                .with_observed_generation(generation),
        );
        conditions::set(
            conds,
            Condition::new(FAILED, true, "BuildFailed", message)
                .with_observed_generation(generation),
        );
    }

    fn owner_ref(&self, obj: &Build, _deps: &Self::Deps) -> Option<OwnerRef> {
        Some(OwnerRef { kind: App::KIND.to_string(), name: obj.spec.app_ref.clone() })
    }

    async fn reconcile(
        &self,
        _client: &C,
        obj: &mut Build,
        _deps: &Self::Deps,
    ) -> anyhow::Result<Outcome> {
        let generation = obj.metadata.generation;
        match self.backend.stage(obj).await.context("staging build")? {
            StagingOutcome::Running => {
                conditions::set(
                    &mut obj.status.conditions,
                    Condition::new(STAGING, true, "BuildRunning", "")
                        .with_observed_generation(generation),
                );
                Ok(Outcome::requeue_after(std::time::Duration::from_millis(500)))
            }
            StagingOutcome::Completed => {
                let conds = &mut obj.status.conditions;
                conditions::set(
                    conds,
                    Condition::new(STAGING, false, "BuildCompleted", "")
                        .with_observed_generation(generation),
                );
                conditions::set(
                    conds,
                    Condition::new(SUCCEEDED, true, "BuildSucceeded", "")
                        .with_observed_generation(generation),
                );
                info!(name = %obj.metadata.name, "build: staging completed");
                Ok(Outcome::done())
            }
            StagingOutcome::Failed { reason } => {
                let conds = &mut obj.status.conditions;
                conditions::set(
                    conds,
                    Condition::new(STAGING, false, "BuildNotRunning", "")
                        .with_observed_generation(generation),
                );
                conditions::set(
                    conds,
                    Condition::new(SUCCEEDED, false, "BuildFailed", &reason)
                        .with_observed_generation(generation),
                );
                conditions::set(
                    conds,
                    Condition::new(FAILED, true, "BuildFailed", &reason)
                        .with_observed_generation(generation),
                );
                info!(name = %obj.metadata.name, reason = %reason, "build: staging failed");
                Ok(Outcome::done())
            }
        }
    }
}

/// Prunes superseded successful builds of one app, keeping the newest N.
/// In-flight and failed builds are left alone; failures stay around for
/// inspection.
pub struct BuildCleaner<C: ScopedClient> {
    client: C,
    retain: usize,
}

impl<C: ScopedClient> BuildCleaner<C> {
    pub fn new(client: C) -> Self {
        let retain = std::env::var(RETENTION_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RETENTION);
        Self { client, retain }
    }

    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }
}

#[async_trait]
impl<C: ScopedClient> Cleaner for BuildCleaner<C> {
    async fn clean(&self, partition: &str, owner: &OwnerRef) -> anyhow::Result<()> {
        if owner.kind != App::KIND {
            return Ok(());
        }

        let mut succeeded: Vec<Build> = self
            .client
            .list::<Build>(partition)
            .await
            .context("listing builds for retention")?
            .into_iter()
            .filter(|b| {
                b.spec.app_ref == owner.name
                    && b.state() == ResourceState::Succeeded
                    && !b.metadata.is_deleting()
            })
            .collect();

        if succeeded.len() <= self.retain {
            return Ok(());
        }

        succeeded.sort_by(|a, b| b.metadata.created_at.cmp(&a.metadata.created_at));
        for stale in &succeeded[self.retain..] {
            debug!(name = %stale.metadata.name, app = %owner.name, "build: pruning superseded build");
            self.client
                .delete::<Build>(partition, &stale.metadata.name)
                .await
                .context("deleting superseded build")?;
        }
        Ok(())
    }
}
