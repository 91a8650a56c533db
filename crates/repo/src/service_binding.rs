//! Service binding repository: CRUD + list + status derivation over the
//! ServiceBinding kind. Creation validates cross-entity references, and for
//! instance types configured as synchronous it blocks on the Ready condition
//! before returning.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_core::{
    conditions::READY, App, InstanceType, Labels, LastOperation, ObjectMeta, Resource,
    ServiceBinding, ServiceBindingSpec, ServiceInstance,
};
use keel_store::{
    ClientFactory, Identity, NameIndex, PartitionRoster, ScopedClient, StoreError,
};
use keel_wait::await_condition;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    dependency_unusable, empty_or_contains, forbidden_as_not_found, from_wait, JobRef,
    MetadataPatch, ReadinessState, RepoError, Selector,
};

/// Label marking a binding as backed by a provisioned service.
pub const PROVISIONED_SERVICE_LABEL: &str = "keel.io/provisioned-service";
/// Label carrying the plan of the bound instance, for plan-scoped queries.
pub const PLAN_LABEL: &str = "keel.io/plan";
/// Admission category the store uses for binding uniqueness conflicts.
pub const UNIQUENESS_CATEGORY: &str = "UniqueServiceBinding";
/// Job operation name for asynchronous (managed) binding creation.
pub const MANAGED_CREATE_OPERATION: &str = "managed_service_binding.create";

/// Admission key for binding uniqueness: one binding per app/instance pair
/// within a partition. Intended to be registered with the store's admission
/// hook under [`UNIQUENESS_CATEGORY`].
pub fn uniqueness_key(raw: &Value) -> Option<String> {
    let app = raw.pointer("/spec/appRef")?.as_str()?;
    let instance = raw.pointer("/spec/instanceRef")?.as_str()?;
    Some(format!("{app}:{instance}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceBindingRecord {
    pub name: String,
    pub display_name: Option<String>,
    pub app_ref: String,
    pub instance_ref: String,
    pub partition: String,
    pub labels: Labels,
    pub annotations: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_operation: LastOperation,
    pub parameters: Value,
    pub ready: bool,
}

impl ServiceBindingRecord {
    pub fn relationships(&self) -> Vec<(&'static str, &str)> {
        vec![("app", self.app_ref.as_str()), ("service_instance", self.instance_ref.as_str())]
    }
}

#[derive(Debug, Clone)]
pub struct CreateServiceBindingMessage {
    pub display_name: Option<String>,
    pub app_ref: String,
    pub instance_ref: String,
    pub partition: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ListServiceBindingsMessage {
    pub app_refs: Vec<String>,
    pub instance_refs: Vec<String>,
    pub plan_refs: Vec<String>,
    pub label_selector: Option<String>,
}

impl ListServiceBindingsMessage {
    fn matches(&self, binding: &ServiceBinding) -> bool {
        empty_or_contains(&self.app_refs, &binding.spec.app_ref)
            && empty_or_contains(&self.instance_refs, &binding.spec.instance_ref)
            && (self.plan_refs.is_empty()
                || binding
                    .metadata
                    .labels
                    .get(PLAN_LABEL)
                    .map(|plan| self.plan_refs.iter().any(|p| p == plan))
                    .unwrap_or(false))
    }
}

#[derive(Debug, Clone)]
pub struct UpdateServiceBindingMessage {
    pub name: String,
    pub metadata: MetadataPatch,
}

/// Outcome of a create: synchronous kinds return the finished record,
/// asynchronous ones an accepted record plus a pollable job reference.
#[derive(Debug, Clone)]
pub enum CreatedServiceBinding {
    Ready(ServiceBindingRecord),
    Accepted { job: JobRef, record: ServiceBindingRecord },
}

impl CreatedServiceBinding {
    pub fn record(&self) -> &ServiceBindingRecord {
        match self {
            CreatedServiceBinding::Ready(r) => r,
            CreatedServiceBinding::Accepted { record, .. } => record,
        }
    }
}

pub struct ServiceBindingRepo<S> {
    store: Arc<S>,
    /// Instance types whose bindings must be observed Ready before create
    /// returns. Kept as configuration rather than an inferred rule.
    sync_instance_types: HashSet<InstanceType>,
    await_timeout: Duration,
}

impl<S> ServiceBindingRepo<S>
where
    S: ClientFactory + PartitionRoster + NameIndex,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            sync_instance_types: HashSet::from([InstanceType::UserProvided]),
            await_timeout: keel_wait::default_timeout(),
        }
    }

    pub fn with_sync_instance_types(
        mut self,
        types: impl IntoIterator<Item = InstanceType>,
    ) -> Self {
        self.sync_instance_types = types.into_iter().collect();
        self
    }

    pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
        self.await_timeout = timeout;
        self
    }

    pub async fn create(
        &self,
        identity: &Identity,
        message: CreateServiceBindingMessage,
    ) -> Result<CreatedServiceBinding, RepoError> {
        let client = self.store.scoped_client(identity)?;

        let _app: App = client
            .get(&message.partition, &message.app_ref)
            .await
            .map_err(|e| dependency_unusable("app", e))?;

        // The instance must live in the same partition as the app; a
        // mismatch is a semantic error, never silently corrected.
        let instance_partition = self
            .store
            .partition_for(ServiceInstance::KIND, &message.instance_ref)
            .await
            .map_err(|e| dependency_unusable("service instance", e))?;
        if instance_partition != message.partition {
            return Err(RepoError::unprocessable(
                "The service instance and the app are in different partitions",
            ));
        }
        let instance: ServiceInstance = client
            .get(&message.partition, &message.instance_ref)
            .await
            .map_err(|e| dependency_unusable("service instance", e))?;

        let mut obj = ServiceBinding {
            metadata: ObjectMeta::new(ObjectMeta::generated_name(), &message.partition),
            spec: ServiceBindingSpec {
                display_name: message.display_name,
                app_ref: message.app_ref,
                instance_ref: message.instance_ref,
                parameters: message.parameters,
            },
            status: Default::default(),
        };
        obj.metadata.labels.insert(PROVISIONED_SERVICE_LABEL.to_string(), "true".to_string());
        if let Some(plan) = &instance.spec.plan_ref {
            obj.metadata.labels.insert(PLAN_LABEL.to_string(), plan.clone());
        }

        let created = client.create(&obj).await.map_err(|e| match e {
            StoreError::AdmissionRejected { category, message }
                if category == UNIQUENESS_CATEGORY =>
            {
                RepoError::Uniqueness { message }
            }
            StoreError::AdmissionRejected { message, .. } => RepoError::unprocessable(message),
            other => RepoError::Store(other),
        })?;
        info!(name = %created.metadata.name, partition = %created.metadata.partition, "repo: service binding created");

        if self.sync_instance_types.contains(&instance.spec.type_) {
            let converged = await_condition(&client, &created, READY, self.await_timeout)
                .await
                .map_err(|e| from_wait(ServiceBinding::KIND, e))?;
            return Ok(CreatedServiceBinding::Ready(to_record(&converged)));
        }

        let job = JobRef {
            operation: MANAGED_CREATE_OPERATION,
            resource_name: created.metadata.name.clone(),
        };
        Ok(CreatedServiceBinding::Accepted { job, record: to_record(&created) })
    }

    pub async fn get(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<ServiceBindingRecord, RepoError> {
        Ok(to_record(&self.get_object(identity, name).await?))
    }

    pub async fn list(
        &self,
        identity: &Identity,
        message: ListServiceBindingsMessage,
    ) -> Result<Vec<ServiceBindingRecord>, RepoError> {
        let selector = match &message.label_selector {
            Some(s) => Selector::parse(s)
                .map_err(|e| RepoError::unprocessable(format!("invalid label selector: {e}")))?,
            None => Selector::default(),
        };

        let client = self.store.scoped_client(identity)?;
        let partitions = self.store.visible_partitions(identity).await?;

        let mut merged: Vec<ServiceBinding> = Vec::new();
        for partition in &partitions {
            match client.list::<ServiceBinding>(partition).await {
                Ok(items) => merged.extend(items),
                Err(e) if e.is_forbidden() => {
                    // Partial authorization loss degrades completeness, it
                    // never aborts the query.
                    metrics::counter!("keel_list_fanout_forbidden_total", 1u64, "kind" => "ServiceBinding");
                    debug!(partition = %partition, "repo: skipping forbidden partition in list fan-out");
                    continue;
                }
                Err(e) => return Err(RepoError::Store(e)),
            }
        }

        Ok(merged
            .iter()
            .filter(|b| message.matches(b) && selector.matches(&b.metadata.labels))
            .map(to_record)
            .collect())
    }

    pub async fn update(
        &self,
        identity: &Identity,
        message: UpdateServiceBindingMessage,
    ) -> Result<ServiceBindingRecord, RepoError> {
        let client = self.store.scoped_client(identity)?;
        let mut obj = self.get_object(identity, &message.name).await?;
        message.metadata.apply(&mut obj.metadata);
        let updated = client
            .update(&obj)
            .await
            .map_err(|e| forbidden_as_not_found(ServiceBinding::KIND, e))?;
        Ok(to_record(&updated))
    }

    pub async fn delete(&self, identity: &Identity, name: &str) -> Result<(), RepoError> {
        let client = self.store.scoped_client(identity)?;
        let obj = self.get_object(identity, name).await?;
        client
            .delete::<ServiceBinding>(&obj.metadata.partition, name)
            .await
            .map_err(|e| forbidden_as_not_found(ServiceBinding::KIND, e))?;
        info!(name, partition = %obj.metadata.partition, "repo: service binding delete requested");
        Ok(())
    }

    /// Pure derivation from the current object; no store call beyond the Get.
    pub async fn get_last_operation(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<LastOperation, RepoError> {
        Ok(self.get(identity, name).await?.last_operation)
    }

    pub async fn get_state(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<ReadinessState, RepoError> {
        let record = self.get(identity, name).await?;
        Ok(if record.ready { ReadinessState::Ready } else { ReadinessState::Unknown })
    }

    pub async fn get_deleted_at(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<Option<DateTime<Utc>>, RepoError> {
        Ok(self.get(identity, name).await?.deleted_at)
    }

    async fn get_object(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<ServiceBinding, RepoError> {
        let partition = self
            .store
            .partition_for(ServiceBinding::KIND, name)
            .await
            .map_err(|e| forbidden_as_not_found(ServiceBinding::KIND, e))?;
        let client = self.store.scoped_client(identity)?;
        client
            .get(&partition, name)
            .await
            .map_err(|e| forbidden_as_not_found(ServiceBinding::KIND, e))
    }
}

fn to_record(binding: &ServiceBinding) -> ServiceBindingRecord {
    ServiceBindingRecord {
        name: binding.metadata.name.clone(),
        display_name: binding.spec.display_name.clone(),
        app_ref: binding.spec.app_ref.clone(),
        instance_ref: binding.spec.instance_ref.clone(),
        partition: binding.metadata.partition.clone(),
        labels: binding.metadata.labels.clone(),
        annotations: binding.metadata.annotations.clone(),
        created_at: binding.metadata.created_at,
        updated_at: last_updated(binding),
        deleted_at: binding.metadata.deletion_timestamp,
        last_operation: binding.last_operation(),
        parameters: binding.spec.parameters.clone(),
        ready: binding.ready(),
    }
}

pub(crate) fn last_updated<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.conditions().iter().map(|c| c.last_transition_time).max()
}
