//! Keel store layer: the interface the rest of the control plane consumes
//! (identity-scoped clients, partition visibility, name resolution, watch
//! streams, admission signals) plus a complete in-memory implementation.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::Resource;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::{MemoryClient, MemoryStore};

/// Per-partition permission level carried by an [`Identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    Read,
    ReadWrite,
}

/// A caller identity with a resolved set of partition grants. The store only
/// consumes the resolved grants; how they were resolved (tokens, role
/// bindings) is someone else's problem.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    grants: FxHashMap<String, Access>,
    all: bool,
}

impl Identity {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), grants: FxHashMap::default(), all: false }
    }

    /// An identity with full access everywhere (controllers, system jobs).
    pub fn privileged(name: impl Into<String>) -> Self {
        Self { name: name.into(), grants: FxHashMap::default(), all: true }
    }

    pub fn grant(mut self, partition: impl Into<String>, access: Access) -> Self {
        self.grants.insert(partition.into(), access);
        self
    }

    pub fn access(&self, partition: &str) -> Access {
        if self.all {
            return Access::ReadWrite;
        }
        self.grants.get(partition).copied().unwrap_or(Access::None)
    }

    pub fn can_read(&self, partition: &str) -> bool {
        !matches!(self.access(partition), Access::None)
    }

    pub fn can_write(&self, partition: &str) -> bool {
        matches!(self.access(partition), Access::ReadWrite)
    }

    /// Partitions this identity has been granted any access to.
    pub fn granted_partitions(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .grants
            .iter()
            .filter(|(_, a)| !matches!(a, Access::None))
            .map(|(p, _)| p.clone())
            .collect();
        out.sort();
        out
    }

    pub fn is_privileged(&self) -> bool {
        self.all
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Applied,
    Deleted,
}

/// Change notification carrying the full object as raw JSON; subscribers
/// decode the kinds they care about.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: String,
    pub partition: String,
    pub name: String,
    pub op: WatchOp,
    pub raw: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("identity {identity} may not {verb} in partition {partition}")]
    Forbidden { identity: String, verb: &'static str, partition: String },

    /// Structured admission rejection; `category` lets callers tell a
    /// uniqueness conflict from a generic validation refusal.
    #[error("admission rejected ({category}): {message}")]
    AdmissionRejected { category: String, message: String },

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found<K: Resource>(name: &str) -> Self {
        StoreError::NotFound { kind: K::KIND.to_string(), name: name.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, StoreError::Forbidden { .. })
    }
}

/// Identity-scoped object store client. Every call is checked against the
/// identity's partition grants; violations surface as
/// [`StoreError::Forbidden`].
#[async_trait]
pub trait ScopedClient: Clone + Send + Sync + 'static {
    async fn get<K: Resource>(&self, partition: &str, name: &str) -> Result<K, StoreError>;

    async fn list<K: Resource>(&self, partition: &str) -> Result<Vec<K>, StoreError>;

    async fn create<K: Resource>(&self, obj: &K) -> Result<K, StoreError>;

    /// Rewrite spec and caller-owned metadata. The store bumps `generation`
    /// when the spec actually changed; `status` is never touched here.
    async fn update<K: Resource>(&self, obj: &K) -> Result<K, StoreError>;

    /// Rewrite `status` only. The controller for a kind is the sole caller.
    async fn update_status<K: Resource>(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete<K: Resource>(&self, partition: &str, name: &str) -> Result<(), StoreError>;

    /// Subscribe to change events for a kind, optionally narrowed to one
    /// partition. A narrowed stream carries only that partition's events;
    /// the all-partition stream requires a privileged identity.
    async fn watch<K: Resource>(
        &self,
        partition: Option<&str>,
    ) -> Result<broadcast::Receiver<WatchEvent>, StoreError>;
}

/// Yields a client scoped to the given identity's permissions.
pub trait ClientFactory: Send + Sync {
    type Client: ScopedClient;

    fn scoped_client(&self, identity: &Identity) -> Result<Self::Client, StoreError>;
}

/// Resolves the set of tenant partitions visible to a caller.
#[async_trait]
pub trait PartitionRoster: Send + Sync {
    async fn visible_partitions(&self, identity: &Identity) -> Result<Vec<String>, StoreError>;
}

/// Name→partition resolution. Names are globally unique per kind, so this is
/// a single lookup; it runs with system privileges (it must work before the
/// caller's own visibility is known).
#[async_trait]
pub trait NameIndex: Send + Sync {
    async fn partition_for(&self, kind: &str, name: &str) -> Result<String, StoreError>;
}
