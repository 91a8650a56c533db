//! Build repository. Builds have asynchronous semantics: create returns an
//! accepted record plus a job reference; progress is polled through the
//! last-operation view while the build controller converges in the
//! background.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{
    App, Build, BuildSpec, Labels, LastOperation, Lifecycle, ObjectMeta, Package, Resource,
    ResourceState,
};
use keel_store::{ClientFactory, Identity, NameIndex, PartitionRoster, ScopedClient, StoreError};
use tracing::{debug, info};

use crate::{
    dependency_unusable, empty_or_contains, forbidden_as_not_found, service_binding::last_updated,
    JobRef, MetadataPatch, ReadinessState, RepoError, Selector,
};

/// Label tying a build to its app, used for app-scoped queries and retention.
pub const APP_LABEL: &str = "keel.io/app";
/// Job operation name for build creation.
pub const CREATE_OPERATION: &str = "build.create";

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub name: String,
    pub app_ref: String,
    pub package_ref: String,
    pub partition: String,
    pub lifecycle: Lifecycle,
    pub labels: Labels,
    pub annotations: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub state: ResourceState,
    pub last_operation: LastOperation,
}

#[derive(Debug, Clone)]
pub struct CreateBuildMessage {
    pub app_ref: String,
    pub package_ref: String,
    pub partition: String,
    /// Defaults to the owning app's lifecycle when absent.
    pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Clone, Default)]
pub struct ListBuildsMessage {
    pub app_refs: Vec<String>,
    pub package_refs: Vec<String>,
    pub states: Vec<ResourceState>,
    pub label_selector: Option<String>,
}

impl ListBuildsMessage {
    fn matches(&self, build: &Build) -> bool {
        empty_or_contains(&self.app_refs, &build.spec.app_ref)
            && empty_or_contains(&self.package_refs, &build.spec.package_ref)
            && (self.states.is_empty() || self.states.contains(&build.state()))
    }
}

#[derive(Debug, Clone)]
pub struct UpdateBuildMessage {
    pub name: String,
    pub metadata: MetadataPatch,
}

#[derive(Debug, Clone)]
pub struct CreatedBuild {
    pub job: JobRef,
    pub record: BuildRecord,
}

pub struct BuildRepo<S> {
    store: Arc<S>,
}

impl<S> BuildRepo<S>
where
    S: ClientFactory + PartitionRoster + NameIndex,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        identity: &Identity,
        message: CreateBuildMessage,
    ) -> Result<CreatedBuild, RepoError> {
        let client = self.store.scoped_client(identity)?;

        let app: App = client
            .get(&message.partition, &message.app_ref)
            .await
            .map_err(|e| dependency_unusable("app", e))?;

        let package_partition = self
            .store
            .partition_for(Package::KIND, &message.package_ref)
            .await
            .map_err(|e| dependency_unusable("package", e))?;
        if package_partition != message.partition {
            return Err(RepoError::unprocessable(
                "The package and the app are in different partitions",
            ));
        }
        let _package: Package = client
            .get(&message.partition, &message.package_ref)
            .await
            .map_err(|e| dependency_unusable("package", e))?;

        let mut obj = Build {
            metadata: ObjectMeta::new(ObjectMeta::generated_name(), &message.partition),
            spec: BuildSpec {
                app_ref: message.app_ref.clone(),
                package_ref: message.package_ref,
                lifecycle: message.lifecycle.unwrap_or_else(|| app.spec.lifecycle.clone()),
            },
            status: Default::default(),
        };
        obj.metadata.labels.insert(APP_LABEL.to_string(), message.app_ref);

        let created = client.create(&obj).await.map_err(|e| match e {
            StoreError::AdmissionRejected { message, .. } => RepoError::unprocessable(message),
            other => RepoError::Store(other),
        })?;
        info!(name = %created.metadata.name, partition = %created.metadata.partition, "repo: build created");

        let job =
            JobRef { operation: CREATE_OPERATION, resource_name: created.metadata.name.clone() };
        Ok(CreatedBuild { job, record: to_record(&created) })
    }

    pub async fn get(&self, identity: &Identity, name: &str) -> Result<BuildRecord, RepoError> {
        Ok(to_record(&self.get_object(identity, name).await?))
    }

    pub async fn list(
        &self,
        identity: &Identity,
        message: ListBuildsMessage,
    ) -> Result<Vec<BuildRecord>, RepoError> {
        let selector = match &message.label_selector {
            Some(s) => Selector::parse(s)
                .map_err(|e| RepoError::unprocessable(format!("invalid label selector: {e}")))?,
            None => Selector::default(),
        };

        let client = self.store.scoped_client(identity)?;
        let partitions = self.store.visible_partitions(identity).await?;

        let mut merged: Vec<Build> = Vec::new();
        for partition in &partitions {
            match client.list::<Build>(partition).await {
                Ok(items) => merged.extend(items),
                Err(e) if e.is_forbidden() => {
                    metrics::counter!("keel_list_fanout_forbidden_total", 1u64, "kind" => "Build");
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
        message: UpdateBuildMessage,
    ) -> Result<BuildRecord, RepoError> {
        let client = self.store.scoped_client(identity)?;
        let mut obj = self.get_object(identity, &message.name).await?;
        message.metadata.apply(&mut obj.metadata);
        let updated =
            client.update(&obj).await.map_err(|e| forbidden_as_not_found(Build::KIND, e))?;
        Ok(to_record(&updated))
    }

    pub async fn delete(&self, identity: &Identity, name: &str) -> Result<(), RepoError> {
        let client = self.store.scoped_client(identity)?;
        let obj = self.get_object(identity, name).await?;
        client
            .delete::<Build>(&obj.metadata.partition, name)
            .await
            .map_err(|e| forbidden_as_not_found(Build::KIND, e))?;
        info!(name, partition = %obj.metadata.partition, "repo: build delete requested");
        Ok(())
    }

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
        let obj = self.get_object(identity, name).await?;
        Ok(if obj.state() == ResourceState::Succeeded
            && obj.metadata.generation == obj.status.observed_generation
        {
            ReadinessState::Ready
        } else {
            ReadinessState::Unknown
        })
    }

    async fn get_object(&self, identity: &Identity, name: &str) -> Result<Build, RepoError> {
        let partition = self
            .store
            .partition_for(Build::KIND, name)
            .await
            .map_err(|e| forbidden_as_not_found(Build::KIND, e))?;
        let client = self.store.scoped_client(identity)?;
        client.get(&partition, name).await.map_err(|e| forbidden_as_not_found(Build::KIND, e))
    }
}

fn to_record(build: &Build) -> BuildRecord {
    BuildRecord {
        name: build.metadata.name.clone(),
        app_ref: build.spec.app_ref.clone(),
        package_ref: build.spec.package_ref.clone(),
        partition: build.metadata.partition.clone(),
        lifecycle: build.spec.lifecycle.clone(),
        labels: build.metadata.labels.clone(),
        annotations: build.metadata.annotations.clone(),
        created_at: build.metadata.created_at,
        updated_at: last_updated(build),
        state: build.state(),
        last_operation: build.last_operation(),
    }
}
