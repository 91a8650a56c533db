#![forbid(unsafe_code)]

use std::time::Duration;

use keel_core::{
    conditions::{self, Condition, READY},
    ObjectMeta, Resource, ServiceBinding, ServiceBindingSpec,
};
use keel_store::{ClientFactory, Identity, MemoryStore, ScopedClient};
use keel_wait::{await_condition, WaitError};

fn binding(name: &str, partition: &str) -> ServiceBinding {
    ServiceBinding {
        metadata: ObjectMeta::new(name, partition),
        spec: ServiceBindingSpec {
            display_name: None,
            app_ref: "app-1".into(),
            instance_ref: "si-1".into(),
            parameters: serde_json::Value::Null,
        },
        status: Default::default(),
    }
}

fn store() -> MemoryStore {
    let store = MemoryStore::new();
    store.add_partition("space-a");
    store
}

/// Flip the Ready condition through the status writer after a delay,
/// standing in for the controller.
fn converge_after(store: &MemoryStore, name: &'static str, delay: Duration) {
    let client = store.scoped_client(&Identity::privileged("controller")).unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut obj: ServiceBinding = client.get("space-a", name).await.unwrap();
        obj.status.observed_generation = obj.metadata.generation;
        conditions::set(
            &mut obj.status.conditions,
            Condition::new(READY, true, "Ready", ""),
        );
        client.update_status(&obj).await.unwrap();
    });
}

#[tokio::test]
async fn returns_updated_object_once_condition_turns_true() {
    let store = store();
    let client = store.scoped_client(&Identity::privileged("system")).unwrap();
    let created = client.create(&binding("sb-1", "space-a")).await.unwrap();

    converge_after(&store, "sb-1", Duration::from_millis(20));

    let updated = await_condition(&client, &created, READY, Duration::from_secs(2))
        .await
        .unwrap();
    // Fields must be re-derived from the returned object.
    assert!(updated.ready());
    assert!(!created.ready());
}

#[tokio::test]
async fn returns_immediately_when_condition_already_true() {
    let store = store();
    let client = store.scoped_client(&Identity::privileged("system")).unwrap();
    let created = client.create(&binding("sb-1", "space-a")).await.unwrap();
    converge_after(&store, "sb-1", Duration::from_millis(0));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let updated = await_condition(&client, &created, READY, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(updated.ready());
}

#[tokio::test]
async fn timeout_does_not_roll_back_background_convergence() {
    let store = store();
    let client = store.scoped_client(&Identity::privileged("system")).unwrap();
    let created = client.create(&binding("sb-1", "space-a")).await.unwrap();

    // Converges well after the wait deadline.
    converge_after(&store, "sb-1", Duration::from_millis(50));

    let err = await_condition(&client, &created, READY, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Timeout { .. }));

    // The operation still succeeds; a later unconditional Get observes it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later: ServiceBinding = client.get("space-a", "sb-1").await.unwrap();
    assert!(later.ready());
}

#[tokio::test]
async fn deletion_while_waiting_is_reported() {
    let store = store();
    let client = store.scoped_client(&Identity::privileged("system")).unwrap();
    let created = client.create(&binding("sb-1", "space-a")).await.unwrap();

    {
        let client = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.delete::<ServiceBinding>("space-a", "sb-1").await.unwrap();
        });
    }

    let err = await_condition(&client, &created, READY, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Deleted { .. }));
}
