//! Dispatch loop: forwards watch events for one kind into a serial worker
//! that re-reads the object and runs the engine. Serial dispatch is the
//! concurrency guarantee the engine relies on; requeues re-enter the same
//! queue after a delay.

use std::time::Duration;

use keel_core::Resource;
use keel_store::{ScopedClient, StoreError, WatchOp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Delegate, Engine};

const REQUEUE_ENV: &str = "KEEL_REQUEUE_MILLIS";
const DEFAULT_REQUEUE_MILLIS: u64 = 100;
const QUEUE_DEPTH: usize = 1024;

fn requeue_delay() -> Duration {
    let millis = std::env::var(REQUEUE_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_REQUEUE_MILLIS);
    Duration::from_millis(millis)
}

pub struct Runner;

impl Runner {
    /// Start the controller for the engine's kind. The engine's client must
    /// be privileged so the watch spans all partitions.
    pub async fn spawn<C, D>(engine: Engine<C, D>) -> Result<RunnerHandle, StoreError>
    where
        C: ScopedClient,
        D: Delegate<C> + 'static,
    {
        let kind = D::Obj::KIND;
        let mut events = engine.client().watch::<D::Obj>(None).await?;
        let (tx, mut rx) = mpsc::channel::<(String, String)>(QUEUE_DEPTH);

        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.op == WatchOp::Deleted {
                            continue;
                        }
                        if forward_tx.send((event.partition, event.name)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped events resurface on the object's next
                        // change; nothing to replay from here.
                        warn!(kind, missed, "runner: watch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let delay = requeue_delay();
        let worker = tokio::spawn(async move {
            while let Some((partition, name)) = rx.recv().await {
                let mut obj = match engine.client().get::<D::Obj>(&partition, &name).await {
                    Ok(obj) => obj,
                    Err(e) if e.is_not_found() => {
                        debug!(kind, name = %name, "runner: object gone before reconcile");
                        continue;
                    }
                    Err(e) => {
                        warn!(kind, name = %name, error = %e, "runner: re-read failed, requeueing");
                        requeue(&tx, delay, partition, name);
                        continue;
                    }
                };

                match engine.reconcile(&mut obj).await {
                    Ok(outcome) => {
                        if let Some(after) = outcome.requeue_after {
                            requeue(&tx, after, partition, name);
                        }
                    }
                    Err(e) => {
                        debug!(kind, name = %name, error = %e, "runner: reconcile errored, requeueing");
                        requeue(&tx, delay, partition, name);
                    }
                }
            }
        });

        Ok(RunnerHandle { forwarder, worker })
    }
}

fn requeue(tx: &mpsc::Sender<(String, String)>, after: Duration, partition: String, name: String) {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send((partition, name)).await;
    });
}

pub struct RunnerHandle {
    forwarder: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn shutdown(self) {
        self.forwarder.abort();
        self.worker.abort();
    }
}
