//! Service binding repository behavior over the in-memory store: reference
//! validation, uniqueness admission, list fan-out, metadata patching, the
//! synchronous create path and its timeout.

use std::sync::Arc;
use std::time::Duration;

use keel_core::{
    conditions::{self, Condition, READY},
    App, AppSpec, InstanceType, Lifecycle, LifecycleType, ObjectMeta, ObjectStatus, OperationState,
    OperationType, Resource, ServiceBinding, ServiceInstance, ServiceInstanceSpec,
};
use keel_repo::{
    service_binding::{self, MANAGED_CREATE_OPERATION, PLAN_LABEL, PROVISIONED_SERVICE_LABEL},
    CreateServiceBindingMessage, CreatedServiceBinding, ListServiceBindingsMessage, MetadataPatch,
    ReadinessState, RepoError, ServiceBindingRepo, UpdateServiceBindingMessage,
};
use keel_store::{
    Access, ClientFactory, Identity, MemoryClient, MemoryStore, NameIndex, PartitionRoster,
    ScopedClient, StoreError, WatchOp,
};
use serde_json::{json, Value};

fn store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_partition("space-a").add_partition("space-b");
    store.unique_rule(
        ServiceBinding::KIND,
        service_binding::UNIQUENESS_CATEGORY,
        service_binding::uniqueness_key,
    );
    store
}

fn repo(store: &MemoryStore) -> ServiceBindingRepo<MemoryStore> {
    // No controller runs in most tests, so nothing is awaited.
    ServiceBindingRepo::new(Arc::new(store.clone()))
        .with_sync_instance_types(Vec::<InstanceType>::new())
}

async fn seed_app(store: &MemoryStore, name: &str, partition: &str) {
    let client = store.scoped_client(&Identity::privileged("seed")).unwrap();
    client
        .create(&App {
            metadata: ObjectMeta::new(name, partition),
            spec: AppSpec {
                display_name: name.to_string(),
                lifecycle: Lifecycle { type_: LifecycleType::Buildpack },
            },
            status: ObjectStatus::default(),
        })
        .await
        .unwrap();
}

async fn seed_instance(store: &MemoryStore, name: &str, partition: &str, plan: Option<&str>) {
    let client = store.scoped_client(&Identity::privileged("seed")).unwrap();
    client
        .create(&ServiceInstance {
            metadata: ObjectMeta::new(name, partition),
            spec: ServiceInstanceSpec {
                type_: InstanceType::UserProvided,
                display_name: name.to_string(),
                plan_ref: plan.map(String::from),
            },
            status: ObjectStatus::default(),
        })
        .await
        .unwrap();
}

fn dev() -> Identity {
    Identity::named("dev").grant("space-a", Access::ReadWrite)
}

fn message(app: &str, instance: &str, partition: &str) -> CreateServiceBindingMessage {
    CreateServiceBindingMessage {
        display_name: Some("db-binding".to_string()),
        app_ref: app.to_string(),
        instance_ref: instance.to_string(),
        partition: partition.to_string(),
        parameters: Value::Null,
    }
}

#[tokio::test]
async fn create_then_get_round_trips_the_record() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", Some("small")).await;
    let repo = repo(&store);

    let mut msg = message("app-1", "si-1", "space-a");
    msg.parameters = json!({"role": "reader"});
    let created = repo.create(&dev(), msg).await.unwrap();

    let (job, record) = match created {
        CreatedServiceBinding::Accepted { job, record } => (job, record),
        CreatedServiceBinding::Ready(_) => panic!("no sync types configured"),
    };
    assert_eq!(job.operation, MANAGED_CREATE_OPERATION);
    assert_eq!(job.resource_name, record.name);
    assert_eq!(record.labels.get(PROVISIONED_SERVICE_LABEL).map(String::as_str), Some("true"));
    assert_eq!(record.labels.get(PLAN_LABEL).map(String::as_str), Some("small"));
    assert!(!record.ready);

    let fetched = repo.get(&dev(), &record.name).await.unwrap();
    assert_eq!(fetched, record);
    assert_eq!(fetched.parameters, json!({"role": "reader"}));
    assert_eq!(fetched.last_operation.op_type, OperationType::Create);
    assert_eq!(fetched.last_operation.state, OperationState::Initial);
}

#[tokio::test]
async fn cross_partition_instance_is_unprocessable_and_creates_nothing() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-b", "space-b", None).await;
    let repo = repo(&store);

    let err = repo.create(&dev(), message("app-1", "si-b", "space-a")).await.unwrap_err();
    match err {
        RepoError::UnprocessableEntity { message } => {
            assert_eq!(message, "The service instance and the app are in different partitions");
        }
        other => panic!("expected unprocessable, got {other:?}"),
    }

    let listed = repo.list(&dev(), ListServiceBindingsMessage::default()).await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn unresolvable_app_is_unprocessable() {
    let store = store();
    seed_instance(&store, "si-1", "space-a", None).await;
    let repo = repo(&store);

    let err = repo.create(&dev(), message("app-ghost", "si-1", "space-a")).await.unwrap_err();
    match err {
        RepoError::UnprocessableEntity { message } => {
            assert!(message.contains("Unable to use app"), "message was {message:?}");
        }
        other => panic!("expected unprocessable, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_app_instance_pair_is_a_uniqueness_conflict() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;
    let repo = repo(&store);

    repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    let err = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap_err();
    assert!(matches!(err, RepoError::Uniqueness { .. }), "got {err:?}");
}

#[tokio::test]
async fn list_spans_only_visible_partitions() {
    let store = store();
    seed_app(&store, "app-a", "space-a").await;
    seed_app(&store, "app-b", "space-b").await;
    seed_instance(&store, "si-a", "space-a", None).await;
    seed_instance(&store, "si-b", "space-b", None).await;
    let repo = repo(&store);

    let admin = Identity::privileged("admin");
    repo.create(&admin, message("app-a", "si-a", "space-a")).await.unwrap();
    repo.create(&admin, message("app-b", "si-b", "space-b")).await.unwrap();

    let all = repo.list(&admin, ListServiceBindingsMessage::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    // An identity granted one partition sees a partial result, not an error.
    let partial = repo.list(&dev(), ListServiceBindingsMessage::default()).await.unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].partition, "space-a");

    let by_app = repo
        .list(
            &admin,
            ListServiceBindingsMessage { app_refs: vec!["app-b".into()], ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(by_app.len(), 1);
    assert_eq!(by_app[0].app_ref, "app-b");
}

/// Roster that advertises every registered partition regardless of the
/// caller's grants, as when directory data outlives a revoked grant.
/// Visibility and list authorization then diverge.
struct BroadRoster {
    inner: MemoryStore,
}

impl ClientFactory for BroadRoster {
    type Client = MemoryClient;

    fn scoped_client(&self, identity: &Identity) -> Result<MemoryClient, StoreError> {
        self.inner.scoped_client(identity)
    }
}

#[async_trait::async_trait]
impl PartitionRoster for BroadRoster {
    async fn visible_partitions(&self, _identity: &Identity) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.partitions())
    }
}

#[async_trait::async_trait]
impl NameIndex for BroadRoster {
    async fn partition_for(&self, kind: &str, name: &str) -> Result<String, StoreError> {
        self.inner.partition_for(kind, name).await
    }
}

#[tokio::test]
async fn list_skips_a_forbidden_partition_and_returns_the_rest() {
    let store = store();
    seed_app(&store, "app-a", "space-a").await;
    seed_app(&store, "app-b", "space-b").await;
    seed_instance(&store, "si-a", "space-a", None).await;
    seed_instance(&store, "si-b", "space-b", None).await;
    repo(&store).create(&Identity::privileged("admin"), message("app-a", "si-a", "space-a"))
        .await
        .unwrap();
    repo(&store).create(&Identity::privileged("admin"), message("app-b", "si-b", "space-b"))
        .await
        .unwrap();

    // The roster names space-b as visible, but dev's list there is
    // Forbidden; the fan-out must degrade to the remaining partition.
    let broad = ServiceBindingRepo::new(Arc::new(BroadRoster { inner: store.clone() }))
        .with_sync_instance_types(Vec::<InstanceType>::new());
    let listed = broad.list(&dev(), ListServiceBindingsMessage::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].partition, "space-a");
}

#[tokio::test]
async fn malformed_label_selector_is_unprocessable() {
    let store = store();
    let repo = repo(&store);

    let err = repo
        .list(
            &dev(),
            ListServiceBindingsMessage {
                label_selector: Some("=broken".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::UnprocessableEntity { .. }), "got {err:?}");
}

#[tokio::test]
async fn label_selector_filters_the_union() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", Some("small")).await;
    seed_instance(&store, "si-2", "space-a", None).await;
    let repo = repo(&store);

    repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    repo.create(&dev(), message("app-1", "si-2", "space-a")).await.unwrap();

    let with_plan = repo
        .list(
            &dev(),
            ListServiceBindingsMessage {
                label_selector: Some(format!("{PLAN_LABEL}=small")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(with_plan.len(), 1);
    assert_eq!(with_plan[0].instance_ref, "si-1");
}

#[tokio::test]
async fn get_folds_forbidden_into_not_found() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;
    let repo = repo(&store);

    let created = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    let name = created.record().name.clone();

    let outsider = Identity::named("outsider");
    let err = repo.get(&outsider, &name).await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn update_patches_caller_owned_metadata() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;
    let repo = repo(&store);

    let created = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    let name = created.record().name.clone();

    let mut patch = MetadataPatch::default();
    patch.labels.insert("team".into(), Some("payments".into()));
    patch.labels.insert(PROVISIONED_SERVICE_LABEL.into(), None);
    patch.annotations.insert("note".into(), Some("rotated".into()));

    let updated = repo
        .update(&dev(), UpdateServiceBindingMessage { name: name.clone(), metadata: patch })
        .await
        .unwrap();
    assert_eq!(updated.labels.get("team").map(String::as_str), Some("payments"));
    assert!(!updated.labels.contains_key(PROVISIONED_SERVICE_LABEL));
    assert_eq!(updated.annotations.get("note").map(String::as_str), Some("rotated"));
}

#[tokio::test]
async fn lingering_delete_reports_delete_operation_until_finalized() {
    let store = store();
    store.linger_deletes(ServiceBinding::KIND);
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;
    let repo = repo(&store);

    let created = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    let name = created.record().name.clone();

    repo.delete(&dev(), &name).await.unwrap();
    assert!(repo.get_deleted_at(&dev(), &name).await.unwrap().is_some());
    let op = repo.get_last_operation(&dev(), &name).await.unwrap();
    assert_eq!(op.op_type, OperationType::Delete);
    assert_eq!(op.state, OperationState::InProgress);
    assert_eq!(repo.get_state(&dev(), &name).await.unwrap(), ReadinessState::Unknown);

    store.finalize(ServiceBinding::KIND, "space-a", &name);
    let err = repo.get(&dev(), &name).await.unwrap_err();
    assert!(err.is_not_found());
}

/// Minimal stand-in for the binding controller: flips Ready on every
/// binding it sees applied.
async fn spawn_converger(store: &MemoryStore) -> tokio::task::JoinHandle<()> {
    let client = store.scoped_client(&Identity::privileged("converger")).unwrap();
    // Subscribe before spawning so the loop cannot miss the create event.
    let mut rx = client.watch::<ServiceBinding>(None).await.unwrap();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.op != WatchOp::Applied {
                continue;
            }
            let Ok(mut obj) = serde_json::from_value::<ServiceBinding>(event.raw) else {
                continue;
            };
            if conditions::is_true(obj.conditions(), READY) {
                continue;
            }
            obj.status.observed_generation = obj.metadata.generation;
            conditions::set(
                &mut obj.status.conditions,
                Condition::new(READY, true, "Ready", "")
                    .with_observed_generation(obj.metadata.generation),
            );
            let _ = client.update_status(&obj).await;
        }
    })
}

#[tokio::test]
async fn sync_create_waits_for_readiness() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;
    let converger = spawn_converger(&store).await;

    let repo = ServiceBindingRepo::new(Arc::new(store.clone()))
        .with_await_timeout(Duration::from_secs(5));
    let created = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap();
    match created {
        CreatedServiceBinding::Ready(record) => assert!(record.ready),
        CreatedServiceBinding::Accepted { .. } => panic!("user-provided create must be sync"),
    }

    converger.abort();
}

#[tokio::test]
async fn sync_create_timeout_leaves_the_binding_in_place() {
    let store = store();
    seed_app(&store, "app-1", "space-a").await;
    seed_instance(&store, "si-1", "space-a", None).await;

    let repo = ServiceBindingRepo::new(Arc::new(store.clone()))
        .with_await_timeout(Duration::from_millis(50));
    let err = repo.create(&dev(), message("app-1", "si-1", "space-a")).await.unwrap_err();
    match err {
        RepoError::Timeout { condition } => assert_eq!(condition, READY),
        other => panic!("expected timeout, got {other:?}"),
    }

    // The wait gave up; the object itself was created and stays.
    let listed = repo.list(&dev(), ListServiceBindingsMessage::default()).await.unwrap();
    assert_eq!(listed.len(), 1);
}
