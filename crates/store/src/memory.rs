//! In-memory declarative store: per-kind, per-partition object maps with
//! generation bumping, admission checks, broadcast watch streams and
//! owner-cascade deletion. Serves tests and in-process deployments; the rest
//! of the workspace only sees the traits in the crate root.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use keel_core::Resource;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    ClientFactory, Identity, NameIndex, PartitionRoster, ScopedClient, StoreError, WatchEvent,
    WatchOp,
};

/// Admission category for duplicate object names.
pub const CATEGORY_DUPLICATE_NAME: &str = "DuplicateName";

type UniqueKeyFn = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

struct UniqueRule {
    category: String,
    key: UniqueKeyFn,
}

struct Inner {
    /// kind → partition → name → raw object
    objects: FxHashMap<String, FxHashMap<String, FxHashMap<String, Value>>>,
    /// (kind, name) → partition; names are globally unique per kind
    name_index: FxHashMap<(String, String), String>,
    partitions: Vec<String>,
    channels: FxHashMap<String, broadcast::Sender<WatchEvent>>,
    /// (kind, partition) channels backing partition-scoped watches; a scoped
    /// subscriber must never see another tenant's objects.
    scoped_channels: FxHashMap<(String, String), broadcast::Sender<WatchEvent>>,
    unique_rules: FxHashMap<String, Vec<UniqueRule>>,
    /// Kinds whose deletes first set a deletion timestamp (owner cleanup
    /// pending) instead of removing the object outright.
    lingering: FxHashSet<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    watch_buffer: usize,
}

/// Handle to the in-memory store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let watch_buffer = std::env::var("KEEL_WATCH_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    objects: FxHashMap::default(),
                    name_index: FxHashMap::default(),
                    partitions: Vec::new(),
                    channels: FxHashMap::default(),
                    scoped_channels: FxHashMap::default(),
                    unique_rules: FxHashMap::default(),
                    lingering: FxHashSet::default(),
                }),
                watch_buffer,
            }),
        }
    }

    /// Register a tenant partition. Writes into unknown partitions fail.
    pub fn add_partition(&self, partition: impl Into<String>) -> &Self {
        let partition = partition.into();
        let mut inner = self.lock();
        if !inner.partitions.contains(&partition) {
            inner.partitions.push(partition);
            inner.partitions.sort();
        }
        self
    }

    /// Mark a kind's deletes as two-phase: the first delete only stamps
    /// `deletionTimestamp`; [`MemoryStore::finalize`] removes the object.
    pub fn linger_deletes(&self, kind: &str) -> &Self {
        self.lock().lingering.insert(kind.to_string());
        self
    }

    /// Register a per-kind uniqueness admission rule: creates whose key
    /// collides with an existing object in the same partition are rejected
    /// with the given category.
    pub fn unique_rule(
        &self,
        kind: &str,
        category: &str,
        key: impl Fn(&Value) -> Option<String> + Send + Sync + 'static,
    ) -> &Self {
        self.lock()
            .unique_rules
            .entry(kind.to_string())
            .or_default()
            .push(UniqueRule { category: category.to_string(), key: Box::new(key) });
        self
    }

    pub fn partitions(&self) -> Vec<String> {
        self.lock().partitions.clone()
    }

    /// Complete a two-phase delete: remove the object and cascade to every
    /// object in the partition that declares it as owner.
    pub fn finalize(&self, kind: &str, partition: &str, name: &str) {
        let mut inner = self.lock();
        remove_cascading(&mut inner, kind, partition, name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self, kind: &str) -> broadcast::Sender<WatchEvent> {
        let buffer = self.shared.watch_buffer;
        let mut inner = self.lock();
        inner
            .channels
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(buffer).0)
            .clone()
    }

    fn scoped_sender(&self, kind: &str, partition: &str) -> broadcast::Sender<WatchEvent> {
        let buffer = self.shared.watch_buffer;
        let mut inner = self.lock();
        inner
            .scoped_channels
            .entry((kind.to_string(), partition.to_string()))
            .or_insert_with(|| broadcast::channel(buffer).0)
            .clone()
    }

    fn publish(&self, kind: &str, partition: &str, name: &str, op: WatchOp, raw: Value) {
        self.publish_event(WatchEvent {
            kind: kind.to_string(),
            partition: partition.to_string(),
            name: name.to_string(),
            op,
            raw,
        });
    }

    fn publish_event(&self, event: WatchEvent) {
        // No receivers is fine; events are best-effort notifications.
        let _ = self.scoped_sender(&event.kind, &event.partition).send(event.clone());
        let _ = self.sender(&event.kind).send(event);
    }
}

fn remove_cascading(inner: &mut Inner, kind: &str, partition: &str, name: &str) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let removed = inner
        .objects
        .get_mut(kind)
        .and_then(|parts| parts.get_mut(partition))
        .and_then(|objs| objs.remove(name));

    let Some(raw) = removed else { return events };
    inner.name_index.remove(&(kind.to_string(), name.to_string()));
    events.push(WatchEvent {
        kind: kind.to_string(),
        partition: partition.to_string(),
        name: name.to_string(),
        op: WatchOp::Deleted,
        raw,
    });

    // Cascade to owned objects in the same partition, any kind.
    let mut owned: Vec<(String, String)> = Vec::new();
    for (other_kind, parts) in inner.objects.iter() {
        if let Some(objs) = parts.get(partition) {
            for (other_name, raw) in objs.iter() {
                if owner_refs(raw).iter().any(|(k, n)| k == kind && n == name) {
                    owned.push((other_kind.clone(), other_name.clone()));
                }
            }
        }
    }
    for (owned_kind, owned_name) in owned {
        events.extend(remove_cascading(inner, &owned_kind, partition, &owned_name));
    }
    events
}

fn owner_refs(raw: &Value) -> Vec<(String, String)> {
    raw.pointer("/metadata/ownerRefs")
        .and_then(|v| v.as_array())
        .map(|refs| {
            refs.iter()
                .filter_map(|r| {
                    Some((
                        r.get("kind")?.as_str()?.to_string(),
                        r.get("name")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl ClientFactory for MemoryStore {
    type Client = MemoryClient;

    fn scoped_client(&self, identity: &Identity) -> Result<MemoryClient, StoreError> {
        Ok(MemoryClient { store: self.clone(), identity: identity.clone() })
    }
}

#[async_trait]
impl PartitionRoster for MemoryStore {
    async fn visible_partitions(&self, identity: &Identity) -> Result<Vec<String>, StoreError> {
        if identity.is_privileged() {
            return Ok(self.partitions());
        }
        let registered = self.partitions();
        Ok(identity
            .granted_partitions()
            .into_iter()
            .filter(|p| registered.contains(p))
            .collect())
    }
}

#[async_trait]
impl NameIndex for MemoryStore {
    async fn partition_for(&self, kind: &str, name: &str) -> Result<String, StoreError> {
        self.lock()
            .name_index
            .get(&(kind.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { kind: kind.to_string(), name: name.to_string() })
    }
}

/// Client bound to one identity; every operation re-checks that identity's
/// grants so a revoked partition fails closed.
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    identity: Identity,
}

impl MemoryClient {
    fn check_read(&self, partition: &str, verb: &'static str) -> Result<(), StoreError> {
        if self.identity.can_read(partition) {
            return Ok(());
        }
        Err(self.forbidden(partition, verb))
    }

    fn check_write(&self, partition: &str, verb: &'static str) -> Result<(), StoreError> {
        if self.identity.can_write(partition) {
            return Ok(());
        }
        Err(self.forbidden(partition, verb))
    }

    fn forbidden(&self, partition: &str, verb: &'static str) -> StoreError {
        StoreError::Forbidden {
            identity: self.identity.name.clone(),
            verb,
            partition: partition.to_string(),
        }
    }
}

fn encode<K: Resource>(obj: &K) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(obj)?)
}

fn decode<K: Resource>(raw: Value) -> Result<K, StoreError> {
    Ok(serde_json::from_value(raw)?)
}

#[async_trait]
impl ScopedClient for MemoryClient {
    async fn get<K: Resource>(&self, partition: &str, name: &str) -> Result<K, StoreError> {
        self.check_read(partition, "get")?;
        let inner = self.store.lock();
        let raw = inner
            .objects
            .get(K::KIND)
            .and_then(|parts| parts.get(partition))
            .and_then(|objs| objs.get(name))
            .cloned()
            .ok_or_else(|| StoreError::not_found::<K>(name))?;
        drop(inner);
        decode(raw)
    }

    async fn list<K: Resource>(&self, partition: &str) -> Result<Vec<K>, StoreError> {
        self.check_read(partition, "list")?;
        let raws: Vec<Value> = {
            let inner = self.store.lock();
            inner
                .objects
                .get(K::KIND)
                .and_then(|parts| parts.get(partition))
                .map(|objs| {
                    let mut entries: Vec<(&String, &Value)> = objs.iter().collect();
                    entries.sort_by(|a, b| a.0.cmp(b.0));
                    entries.into_iter().map(|(_, v)| v.clone()).collect()
                })
                .unwrap_or_default()
        };
        raws.into_iter().map(decode).collect()
    }

    async fn create<K: Resource>(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.metadata();
        let (partition, name) = (meta.partition.clone(), meta.name.clone());
        self.check_write(&partition, "create")?;

        let mut raw = encode(obj)?;
        let raw_out = {
            let mut inner = self.store.lock();
            if !inner.partitions.contains(&partition) {
                return Err(StoreError::NotFound {
                    kind: "Partition".to_string(),
                    name: partition.clone(),
                });
            }
            if inner.name_index.contains_key(&(K::KIND.to_string(), name.clone())) {
                return Err(StoreError::AdmissionRejected {
                    category: CATEGORY_DUPLICATE_NAME.to_string(),
                    message: format!("{} \"{}\" already exists", K::KIND, name),
                });
            }
            if let Some(rules) = inner.unique_rules.get(K::KIND) {
                for rule in rules {
                    let Some(key) = (rule.key)(&raw) else { continue };
                    let collision = inner
                        .objects
                        .get(K::KIND)
                        .and_then(|parts| parts.get(&partition))
                        .map(|objs| {
                            objs.values().any(|existing| (rule.key)(existing).as_ref() == Some(&key))
                        })
                        .unwrap_or(false);
                    if collision {
                        return Err(StoreError::AdmissionRejected {
                            category: rule.category.clone(),
                            message: format!(
                                "{} with key \"{}\" already exists in partition {}",
                                K::KIND,
                                key,
                                partition
                            ),
                        });
                    }
                }
            }

            // Store-owned fields.
            if let Some(meta) = raw.pointer_mut("/metadata") {
                meta["uid"] = Value::String(uuid::Uuid::new_v4().to_string());
                meta["generation"] = Value::from(1);
                meta["createdAt"] = serde_json::to_value(Utc::now())?;
                meta["deletionTimestamp"] = Value::Null;
            }

            inner
                .objects
                .entry(K::KIND.to_string())
                .or_default()
                .entry(partition.clone())
                .or_default()
                .insert(name.clone(), raw.clone());
            inner.name_index.insert((K::KIND.to_string(), name.clone()), partition.clone());
            raw
        };

        debug!(kind = K::KIND, name = %name, partition = %partition, "store: created");
        self.store.publish(K::KIND, &partition, &name, WatchOp::Applied, raw_out.clone());
        decode(raw_out)
    }

    async fn update<K: Resource>(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.metadata();
        let (partition, name) = (meta.partition.clone(), meta.name.clone());
        self.check_write(&partition, "update")?;

        let mut raw = encode(obj)?;
        let raw_out = {
            let mut inner = self.store.lock();
            let stored = inner
                .objects
                .get_mut(K::KIND)
                .and_then(|parts| parts.get_mut(&partition))
                .and_then(|objs| objs.get_mut(&name))
                .ok_or_else(|| StoreError::not_found::<K>(&name))?;

            let mut generation =
                stored.pointer("/metadata/generation").and_then(|v| v.as_i64()).unwrap_or(0);
            if raw.get("spec") != stored.get("spec") {
                generation += 1;
            }

            // Store-owned fields survive the rewrite; status keeps its single
            // writer by staying untouched here.
            raw["status"] = stored.get("status").cloned().unwrap_or(Value::Null);
            if let Some(meta) = raw.pointer_mut("/metadata") {
                for field in ["uid", "createdAt", "deletionTimestamp"] {
                    meta[field] =
                        stored.pointer(&format!("/metadata/{field}")).cloned().unwrap_or(Value::Null);
                }
                meta["generation"] = Value::from(generation);
            }

            *stored = raw.clone();
            raw
        };

        self.store.publish(K::KIND, &partition, &name, WatchOp::Applied, raw_out.clone());
        decode(raw_out)
    }

    async fn update_status<K: Resource>(&self, obj: &K) -> Result<K, StoreError> {
        let meta = obj.metadata();
        let (partition, name) = (meta.partition.clone(), meta.name.clone());
        self.check_write(&partition, "update status")?;

        let raw = encode(obj)?;
        let raw_out = {
            let mut inner = self.store.lock();
            let stored = inner
                .objects
                .get_mut(K::KIND)
                .and_then(|parts| parts.get_mut(&partition))
                .and_then(|objs| objs.get_mut(&name))
                .ok_or_else(|| StoreError::not_found::<K>(&name))?;
            stored["status"] = raw.get("status").cloned().unwrap_or(Value::Null);
            stored.clone()
        };

        self.store.publish(K::KIND, &partition, &name, WatchOp::Applied, raw_out.clone());
        decode(raw_out)
    }

    async fn delete<K: Resource>(&self, partition: &str, name: &str) -> Result<(), StoreError> {
        self.check_write(partition, "delete")?;

        let (lingering_update, events) = {
            let mut inner = self.store.lock();
            let exists = inner
                .objects
                .get(K::KIND)
                .and_then(|parts| parts.get(partition))
                .map(|objs| objs.contains_key(name))
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::not_found::<K>(name));
            }

            if inner.lingering.contains(K::KIND) {
                let stored = inner
                    .objects
                    .get_mut(K::KIND)
                    .and_then(|parts| parts.get_mut(partition))
                    .and_then(|objs| objs.get_mut(name))
                    .ok_or_else(|| StoreError::not_found::<K>(name))?;
                if stored
                    .pointer("/metadata/deletionTimestamp")
                    .map(|v| v.is_null())
                    .unwrap_or(true)
                {
                    if let Some(meta) = stored.pointer_mut("/metadata") {
                        meta["deletionTimestamp"] = serde_json::to_value(Utc::now())?;
                    }
                }
                (Some(stored.clone()), Vec::new())
            } else {
                (None, remove_cascading(&mut inner, K::KIND, partition, name))
            }
        };

        if let Some(raw) = lingering_update {
            debug!(kind = K::KIND, name, partition, "store: delete pending (lingering)");
            self.store.publish(K::KIND, partition, name, WatchOp::Applied, raw);
        } else {
            for event in events {
                self.store.publish_event(event);
            }
        }
        Ok(())
    }

    async fn watch<K: Resource>(
        &self,
        partition: Option<&str>,
    ) -> Result<broadcast::Receiver<WatchEvent>, StoreError> {
        if let Some(p) = partition {
            self.check_read(p, "watch")?;
            return Ok(self.store.scoped_sender(K::KIND, p).subscribe());
        }
        if !self.identity.is_privileged() {
            warn!(identity = %self.identity.name, kind = K::KIND, "store: all-partition watch requires privilege");
            return Err(StoreError::Forbidden {
                identity: self.identity.name.clone(),
                verb: "watch",
                partition: "*".to_string(),
            });
        }
        Ok(self.store.sender(K::KIND).subscribe())
    }
}
