//! Keel reconciliation engine: a generic, condition-driven convergence pass
//! over one object at a time, with kind-specific behavior behind a
//! [`Delegate`] chosen at construction time.
//!
//! The engine owns the ordering (cleaner, deletion short-circuit,
//! observed-generation stamp, converged check, dependency resolution,
//! business validation, owner linking, delegate hand-off) and the
//! retryable/terminal distinction: `Err` from a pass means requeue,
//! `Ok` with failure conditions written means stop.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use keel_core::{
    conditions::{self, FAILED},
    OwnerRef, Resource,
};
use keel_store::ScopedClient;
use serde_json::Value;
use tracing::{debug, info, warn};

pub mod binding;
pub mod build;
pub mod runner;

pub use binding::{BindingDelegate, BindingProvisioner, ProvisionOutcome, UserProvidedProvisioner};
pub use build::{BuildCleaner, BuildDelegate, StagingBackend, StagingOutcome};
pub use runner::{Runner, RunnerHandle};

/// Result of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Nothing further to do until the next change event.
    pub fn done() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self { requeue_after: Some(delay) }
    }
}

/// Kind-specific reconciliation behavior. One implementation per kind,
/// handed to the engine at construction; the engine never inspects types at
/// runtime.
#[async_trait]
pub trait Delegate<C: ScopedClient>: Send + Sync {
    type Obj: Resource;
    type Deps: Send + Sync;

    /// Logical owner whose superseded children should be garbage collected
    /// ahead of this pass, if the kind has a cleaner.
    fn cleanup_owner(&self, _obj: &Self::Obj) -> Option<OwnerRef> {
        None
    }

    /// Condition type whose truth marks this kind terminally converged.
    fn terminal_condition(&self) -> &'static str;

    /// Fetch the referenced objects needed to reconcile. A failure here is
    /// retryable: the engine surfaces it as `Err` and the dispatch layer
    /// requeues.
    async fn dependencies(&self, client: &C, obj: &Self::Obj) -> anyhow::Result<Self::Deps>;

    /// Invariants the dependencies must jointly satisfy. A violation is
    /// terminal: it will not resolve without a new generation.
    fn validate(&self, _obj: &Self::Obj, _deps: &Self::Deps) -> Result<(), String> {
        Ok(())
    }

    /// Record terminal failure conditions for a validation violation. The
    /// message must be descriptive enough for a human reading LastOperation.
    fn mark_validation_failed(&self, obj: &mut Self::Obj, message: &str);

    /// Owner reference to link for cascade cleanup, once validated.
    fn owner_ref(&self, _obj: &Self::Obj, _deps: &Self::Deps) -> Option<OwnerRef> {
        None
    }

    /// Delegated provisioning: drive convergence and set progress/success
    /// conditions. The engine assumes nothing about what success means
    /// beyond condition flags.
    async fn reconcile(
        &self,
        client: &C,
        obj: &mut Self::Obj,
        deps: &Self::Deps,
    ) -> anyhow::Result<Outcome>;
}

/// Best-effort garbage collection of superseded sibling objects under one
/// logical owner. Failures are logged, never block the current pass.
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn clean(&self, partition: &str, owner: &OwnerRef) -> anyhow::Result<()>;
}

pub struct Engine<C: ScopedClient, D: Delegate<C>> {
    client: C,
    delegate: D,
    cleaner: Option<Arc<dyn Cleaner>>,
}

impl<C: ScopedClient, D: Delegate<C>> Engine<C, D> {
    /// `client` must be privileged: the engine is the sole status writer for
    /// its kind and watches across partitions.
    pub fn new(client: C, delegate: D) -> Self {
        Self { client, delegate, cleaner: None }
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one reconcile pass against `obj`. The dispatch layer guarantees
    /// at most one concurrent pass per object identity.
    pub async fn reconcile(&self, obj: &mut D::Obj) -> anyhow::Result<Outcome> {
        let kind = D::Obj::KIND;
        let name = obj.metadata().name.clone();
        let partition = obj.metadata().partition.clone();

        if let Some(cleaner) = &self.cleaner {
            if let Some(owner) = self.delegate.cleanup_owner(obj) {
                if let Err(e) = cleaner.clean(&partition, &owner).await {
                    warn!(kind, name = %name, error = %e, "reconcile: cleaner failed, continuing");
                }
            }
        }

        if obj.metadata().is_deleting() {
            debug!(kind, name = %name, "reconcile: deletion pending, nothing to do");
            return Ok(Outcome::done());
        }

        let before_status = serde_json::to_value(obj.status())?;

        // Stamp before any side effect that could re-trigger us: a pure
        // status change must observe an up-to-date generation.
        obj.status_mut().observed_generation = obj.metadata().generation;

        let terminal = self.delegate.terminal_condition();
        if conditions::is_true(obj.conditions(), terminal)
            || conditions::is_true(obj.conditions(), FAILED)
        {
            debug!(kind, name = %name, "reconcile: already converged");
            self.flush_status(obj, &before_status).await?;
            return Ok(Outcome::done());
        }

        let deps = match self.delegate.dependencies(&self.client, obj).await {
            Ok(deps) => deps,
            Err(e) => {
                metrics::counter!("keel_reconcile_total", 1u64, "kind" => kind, "outcome" => "retry");
                info!(kind, name = %name, error = %e, "reconcile: dependency fetch failed, will retry");
                return Err(e);
            }
        };

        if let Err(message) = self.delegate.validate(obj, &deps) {
            self.delegate.mark_validation_failed(obj, &message);
            self.flush_status(obj, &before_status).await?;
            metrics::counter!("keel_reconcile_total", 1u64, "kind" => kind, "outcome" => "terminal_failure");
            info!(kind, name = %name, reason = %message, "reconcile: validation failed terminally");
            return Ok(Outcome::done());
        }

        if let Some(owner) = self.delegate.owner_ref(obj, &deps) {
            if !obj.metadata().owner_refs.contains(&owner) {
                obj.metadata_mut().owner_refs.push(owner);
                // The store preserves its own copy of status on update; keep
                // the locally stamped one.
                let local_status = obj.status().clone();
                let mut refreshed =
                    self.client.update(obj).await.context("linking owner reference")?;
                *refreshed.status_mut() = local_status;
                *obj = refreshed;
            }
        }

        let outcome = match self.delegate.reconcile(&self.client, obj, &deps).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Keep whatever progress conditions the delegate managed to
                // set before failing.
                let _ = self.flush_status(obj, &before_status).await;
                metrics::counter!("keel_reconcile_total", 1u64, "kind" => kind, "outcome" => "retry");
                return Err(e);
            }
        };

        self.flush_status(obj, &before_status).await?;
        metrics::counter!("keel_reconcile_total", 1u64, "kind" => kind, "outcome" => "ok");
        Ok(outcome)
    }

    /// Write status through the single-writer channel, but only when this
    /// pass actually changed it; an unchanged write would re-trigger the
    /// watch for nothing.
    async fn flush_status(&self, obj: &D::Obj, before: &Value) -> anyhow::Result<()> {
        let now = serde_json::to_value(obj.status())?;
        if &now == before {
            return Ok(());
        }
        self.client.update_status(obj).await.context("writing status")?;
        Ok(())
    }
}
