//! Keel condition awaiter: suspends a synchronous caller until a named
//! condition on one object becomes true, the object disappears, or the
//! deadline passes. A timed-out wait says nothing about the operation
//! itself; background convergence keeps going.

#![forbid(unsafe_code)]

use std::time::Duration;

use keel_core::{conditions, Resource};
use keel_store::{ScopedClient, StoreError, WatchEvent, WatchOp};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The deadline passed before the condition was observed true. The
    /// underlying object is untouched; a later Get may still show success.
    #[error("timed out awaiting condition {condition} on {kind} \"{name}\"")]
    Timeout { kind: &'static str, name: String, condition: String },

    /// The object was deleted while waiting.
    #[error("{kind} \"{name}\" was deleted while awaiting condition {condition}")]
    Deleted { kind: &'static str, name: String, condition: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Default await deadline, from `KEEL_AWAIT_TIMEOUT_SECS` (fallback 20s).
pub fn default_timeout() -> Duration {
    let secs = std::env::var("KEEL_AWAIT_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(20);
    Duration::from_secs(secs)
}

/// Block until `condition` on `obj` is observed true, returning the freshest
/// observed object. Callers must re-derive any fields from the returned
/// object, not from their pre-wait snapshot.
///
/// Subscribes before re-reading so no update can slip between the two;
/// suspends on the subscription (never a poll interval). Dropping the future
/// releases the subscription on every path.
pub async fn await_condition<C: ScopedClient, K: Resource>(
    client: &C,
    obj: &K,
    condition: &str,
    timeout: Duration,
) -> Result<K, WaitError> {
    let meta = obj.metadata();
    let (partition, name) = (meta.partition.clone(), meta.name.clone());

    let rx = client.watch::<K>(Some(&partition)).await?;
    debug!(kind = K::KIND, name = %name, condition, "await: watching");

    tokio::time::timeout(
        timeout,
        watch_for_condition::<C, K>(client, rx, &partition, &name, condition),
    )
    .await
    .unwrap_or_else(|_| {
        debug!(kind = K::KIND, name = %name, condition, "await: deadline exceeded");
        Err(WaitError::Timeout {
            kind: K::KIND,
            name: name.clone(),
            condition: condition.to_string(),
        })
    })
}

async fn watch_for_condition<C: ScopedClient, K: Resource>(
    client: &C,
    mut rx: tokio::sync::broadcast::Receiver<WatchEvent>,
    partition: &str,
    name: &str,
    condition: &str,
) -> Result<K, WaitError> {
    // The object may already be converged, or may have been deleted before
    // we subscribed.
    match client.get::<K>(partition, name).await {
        Ok(current) if conditions::is_true(current.conditions(), condition) => return Ok(current),
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            return Err(WaitError::Deleted {
                kind: K::KIND,
                name: name.to_string(),
                condition: condition.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    }

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                // Missed events: fall back to a fresh read rather than trust
                // the stream.
                warn!(kind = K::KIND, name, missed, "await: subscription lagged, re-reading");
                match client.get::<K>(partition, name).await {
                    Ok(current) if conditions::is_true(current.conditions(), condition) => {
                        return Ok(current)
                    }
                    Ok(_) => continue,
                    Err(e) if e.is_not_found() => {
                        return Err(WaitError::Deleted {
                            kind: K::KIND,
                            name: name.to_string(),
                            condition: condition.to_string(),
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(RecvError::Closed) => {
                return Err(StoreError::NotFound {
                    kind: K::KIND.to_string(),
                    name: name.to_string(),
                }
                .into())
            }
        };

        if event.partition != partition || event.name != name {
            continue;
        }
        match event.op {
            WatchOp::Deleted => {
                return Err(WaitError::Deleted {
                    kind: K::KIND,
                    name: name.to_string(),
                    condition: condition.to_string(),
                })
            }
            WatchOp::Applied => {
                let updated: K = serde_json::from_value(event.raw).map_err(StoreError::from)?;
                if conditions::is_true(updated.conditions(), condition) {
                    debug!(kind = K::KIND, name, condition, "await: condition observed true");
                    return Ok(updated);
                }
            }
        }
    }
}
