//! Service binding controller pieces. The delegate drives a pluggable
//! provisioner; user-provided instances bind without any broker round-trip,
//! which is what makes their create path synchronous upstream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use keel_core::{
    conditions::{self, Condition, FAILED, READY},
    App, InstanceType, OwnerRef, Resource, ServiceBinding, ServiceInstance,
};
use keel_store::ScopedClient;
use tracing::info;

use crate::{Delegate, Outcome};

/// Carries out the actual credential exchange for a binding. Called once per
/// reconcile pass until it reports a terminal outcome.
#[async_trait]
pub trait BindingProvisioner: Send + Sync {
    async fn provision(
        &self,
        binding: &ServiceBinding,
        instance: &ServiceInstance,
    ) -> anyhow::Result<ProvisionOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned,
    InProgress,
    Failed { reason: String },
}

/// User-provided instances carry their credentials inline, so binding them
/// is a pure bookkeeping step.
pub struct UserProvidedProvisioner;

#[async_trait]
impl BindingProvisioner for UserProvidedProvisioner {
    async fn provision(
        &self,
        _binding: &ServiceBinding,
        _instance: &ServiceInstance,
    ) -> anyhow::Result<ProvisionOutcome> {
        Ok(ProvisionOutcome::Provisioned)
    }
}

pub struct BindingDelegate {
    provisioner: Arc<dyn BindingProvisioner>,
}

impl BindingDelegate {
    pub fn new(provisioner: Arc<dyn BindingProvisioner>) -> Self {
        Self { provisioner }
    }

    pub fn user_provided() -> Self {
        Self::new(Arc::new(UserProvidedProvisioner))
    }
}

#[async_trait]
impl<C: ScopedClient> Delegate<C> for BindingDelegate {
    type Obj = ServiceBinding;
    type Deps = (App, ServiceInstance);

    fn terminal_condition(&self) -> &'static str {
        READY
    }

    async fn dependencies(&self, client: &C, obj: &ServiceBinding) -> anyhow::Result<Self::Deps> {
        let partition = &obj.metadata.partition;
        let app: App =
            client.get(partition, &obj.spec.app_ref).await.context("fetching app")?;
        let instance: ServiceInstance = client
            .get(partition, &obj.spec.instance_ref)
            .await
            .context("fetching service instance")?;
        Ok((app, instance))
    }

    fn validate(&self, _obj: &ServiceBinding, (_, instance): &Self::Deps) -> Result<(), String> {
        if instance.spec.type_ == InstanceType::Managed && instance.spec.plan_ref.is_none() {
            return Err(format!(
                "managed service instance \"{}\" has no plan",
                instance.metadata.name
            ));
        }
        Ok(())
    }

    fn mark_validation_failed(&self, obj: &mut ServiceBinding, message: &str) {
        let generation = obj.metadata.generation;
        let conds = &mut obj.status.conditions;
        conditions::set(
            conds,
            Condition::new(READY, false, "BindingFailed", message)
                .with_observed_generation(generation),
        );
        conditions::set(
            conds,
            Condition::new(FAILED, true, "BindingFailed", message)
                .with_observed_generation(generation),
        );
    }

    fn owner_ref(&self, _obj: &ServiceBinding, (_, instance): &Self::Deps) -> Option<OwnerRef> {
        Some(OwnerRef { kind: ServiceInstance::KIND.to_string(), name: instance.metadata.name.clone() })
    }

    async fn reconcile(
        &self,
        _client: &C,
        obj: &mut ServiceBinding,
        (_, instance): &Self::Deps,
    ) -> anyhow::Result<Outcome> {
        let generation = obj.metadata.generation;
        match self.provisioner.provision(obj, instance).await.context("provisioning binding")? {
            ProvisionOutcome::Provisioned => {
                conditions::set(
                    &mut obj.status.conditions,
                    Condition::new(READY, true, "Ready", "")
                        .with_observed_generation(generation),
                );
                info!(name = %obj.metadata.name, instance = %instance.metadata.name, "binding: provisioned");
                Ok(Outcome::done())
            }
            ProvisionOutcome::InProgress => {
                conditions::set(
                    &mut obj.status.conditions,
                    Condition::new(READY, false, "ProvisioningInProgress", "")
                        .with_observed_generation(generation),
                );
                Ok(Outcome::requeue_after(Duration::from_millis(500)))
            }
            ProvisionOutcome::Failed { reason } => {
                let conds = &mut obj.status.conditions;
                conditions::set(
                    conds,
                    Condition::new(READY, false, "BindingFailed", &reason)
                        .with_observed_generation(generation),
                );
                conditions::set(
                    conds,
                    Condition::new(FAILED, true, "BindingFailed", &reason)
                        .with_observed_generation(generation),
                );
                info!(name = %obj.metadata.name, reason = %reason, "binding: provisioning failed");
                Ok(Outcome::done())
            }
        }
    }
}
