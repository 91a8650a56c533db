//! Concrete managed kinds. Each kind is a plain serde struct with shared
//! metadata/status shapes; the [`Resource`] impls are what the generic
//! machinery (store, awaiter, engine) keys on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::Condition;
use crate::{ObjectMeta, Resource};

/// Observed state common to every kind: the change-counter pair plus the
/// condition set. Only the controller for a kind writes this.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleType {
    Buildpack,
    Docker,
}

impl std::fmt::Display for LifecycleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleType::Buildpack => write!(f, "buildpack"),
            LifecycleType::Docker => write!(f, "docker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    #[serde(rename = "type")]
    pub type_: LifecycleType,
}

/// Source artifact flavor; determines which lifecycle may build it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Bits,
    Docker,
}

impl std::fmt::Display for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageType::Bits => write!(f, "bits"),
            PackageType::Docker => write!(f, "docker"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    UserProvided,
    Managed,
}

// ---- kinds ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub metadata: ObjectMeta,
    pub spec: AppSpec,
    #[serde(default)]
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub display_name: String,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub metadata: ObjectMeta,
    pub spec: PackageSpec,
    #[serde(default)]
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    #[serde(rename = "type")]
    pub type_: PackageType,
    pub app_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub metadata: ObjectMeta,
    pub spec: BuildSpec,
    #[serde(default)]
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub app_ref: String,
    pub package_ref: String,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub metadata: ObjectMeta,
    pub spec: ServiceInstanceSpec,
    #[serde(default)]
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    #[serde(rename = "type")]
    pub type_: InstanceType,
    pub display_name: String,
    #[serde(default)]
    pub plan_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    pub metadata: ObjectMeta,
    pub spec: ServiceBindingSpec,
    #[serde(default)]
    pub status: ObjectStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    #[serde(default)]
    pub display_name: Option<String>,
    pub app_ref: String,
    pub instance_ref: String,
    /// Opaque parameter blob handed to the provisioner.
    #[serde(default)]
    pub parameters: Value,
}

macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl Resource for $ty {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
            fn status(&self) -> &ObjectStatus {
                &self.status
            }
            fn status_mut(&mut self) -> &mut ObjectStatus {
                &mut self.status
            }
        }
    };
}

impl_resource!(App, "App");
impl_resource!(Package, "Package");
impl_resource!(Build, "Build");
impl_resource!(ServiceInstance, "ServiceInstance");
impl_resource!(ServiceBinding, "ServiceBinding");
