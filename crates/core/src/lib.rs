//! Keel core types: the declarative object model shared by the store,
//! the repositories and the reconciliation engine.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod conditions;
pub mod kinds;
pub mod state;

pub use conditions::Condition;
pub use kinds::{
    App, AppSpec, Build, BuildSpec, InstanceType, Lifecycle, LifecycleType, ObjectStatus, Package,
    PackageSpec, PackageType, ServiceBinding, ServiceBindingSpec, ServiceInstance,
    ServiceInstanceSpec,
};
pub use state::{derive_state, LastOperation, OperationState, OperationType, ResourceState};

pub type Labels = BTreeMap<String, String>;

/// Back-reference to a parent object. The store cascades deletion from the
/// owner to the owned object; ownership is declared, not exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Metadata common to every declarative object.
///
/// `name` is globally unique per kind and doubles as the externally visible
/// identifier; `partition` is the tenant-isolation boundary. `generation` is
/// bumped by the store on every spec mutation, never by writers directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub partition: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub owner_refs: Vec<OwnerRef>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: partition.into(),
            uid: String::new(),
            generation: 0,
            labels: Labels::new(),
            annotations: Labels::new(),
            owner_refs: Vec::new(),
            created_at: Utc::now(),
            deletion_timestamp: None,
        }
    }

    /// Generate a fresh globally unique name.
    pub fn generated_name() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A managed declarative object kind. Implemented by every concrete kind in
/// [`kinds`]; the store, the awaiter and the engine only see this trait.
pub trait Resource:
    Clone + Send + Sync + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &ObjectStatus;
    fn status_mut(&mut self) -> &mut ObjectStatus;

    fn conditions(&self) -> &[Condition] {
        &self.status().conditions
    }

    /// A stale observation must never report ready: the Ready condition only
    /// counts once the controller has caught up with the latest generation.
    fn ready(&self) -> bool {
        self.metadata().generation == self.status().observed_generation
            && conditions::is_true(self.conditions(), conditions::READY)
    }

    fn state(&self) -> ResourceState {
        derive_state(self.conditions(), self.metadata().deletion_timestamp.as_ref())
    }

    fn last_operation(&self) -> LastOperation {
        state::last_operation(self.metadata(), self.conditions())
    }
}
