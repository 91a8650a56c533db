//! Keel entity repositories: translate between caller-facing domain records
//! and declarative store objects, one repository per managed kind.
//!
//! Repositories resolve ambiguous failures at the boundary, folding Forbidden
//! into NotFound so an unauthorized caller cannot probe for tenant existence.
//! They never write object status.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::ObjectMeta;
use keel_store::StoreError;
use keel_wait::WaitError;

pub mod build;
pub mod selector;
pub mod service_binding;

pub use build::{
    BuildRecord, BuildRepo, CreateBuildMessage, CreatedBuild, ListBuildsMessage,
    UpdateBuildMessage,
};
pub use selector::Selector;
pub use service_binding::{
    CreateServiceBindingMessage, CreatedServiceBinding, ListServiceBindingsMessage,
    ServiceBindingRecord, ServiceBindingRepo, UpdateServiceBindingMessage,
};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Object absent, or the caller is not allowed to know either way.
    #[error("{kind} not found")]
    NotFound { kind: &'static str },

    #[error("unprocessable: {message}")]
    UnprocessableEntity { message: String },

    #[error("uniqueness conflict: {message}")]
    Uniqueness { message: String },

    /// The wait for convergence gave up; the operation itself may still
    /// succeed in the background.
    #[error("timed out awaiting condition {condition}")]
    Timeout { condition: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RepoError {
    pub fn unprocessable(message: impl Into<String>) -> Self {
        RepoError::UnprocessableEntity { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound { .. })
    }
}

/// Fold Forbidden (and absence) into NotFound at the caller boundary.
pub(crate) fn forbidden_as_not_found(kind: &'static str, err: StoreError) -> RepoError {
    match err {
        StoreError::Forbidden { .. } | StoreError::NotFound { .. } => RepoError::NotFound { kind },
        other => RepoError::Store(other),
    }
}

/// A cross-entity reference that cannot be resolved (absent or invisible) is
/// a semantic problem with the request, not a lookup failure.
pub(crate) fn dependency_unusable(what: &str, err: StoreError) -> RepoError {
    match err {
        StoreError::Forbidden { .. } | StoreError::NotFound { .. } => RepoError::unprocessable(
            format!("Unable to use {what}. Ensure that it exists and you have access to it."),
        ),
        other => RepoError::Store(other),
    }
}

pub(crate) fn from_wait(kind: &'static str, err: WaitError) -> RepoError {
    match err {
        WaitError::Timeout { condition, .. } => RepoError::Timeout { condition },
        WaitError::Deleted { .. } => RepoError::NotFound { kind },
        WaitError::Store(e) => RepoError::Store(e),
    }
}

/// Coarse readiness for state polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Unknown,
    Ready,
}

/// Reference handed back for asynchronous creations, usable to poll the
/// entity's last operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub operation: &'static str,
    pub resource_name: String,
}

/// Merge-style patch for caller-owned metadata; `None` removes a key.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    pub fn apply(&self, meta: &mut ObjectMeta) {
        for (k, v) in &self.labels {
            match v {
                Some(v) => {
                    meta.labels.insert(k.clone(), v.clone());
                }
                None => {
                    meta.labels.remove(k);
                }
            }
        }
        for (k, v) in &self.annotations {
            match v {
                Some(v) => {
                    meta.annotations.insert(k.clone(), v.clone());
                }
                None => {
                    meta.annotations.remove(k);
                }
            }
        }
    }
}

/// OR within a field: an empty filter set matches everything.
pub(crate) fn empty_or_contains(set: &[String], value: &str) -> bool {
    set.is_empty() || set.iter().any(|v| v == value)
}
