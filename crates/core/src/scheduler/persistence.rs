//! Background writer for pending-task metadata.
//!
//! Dispatch never awaits storage. Every structural change to the pending
//! set sends a full snapshot over an unbounded channel; the writer keeps
//! only the newest snapshot it can see and writes that one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flightdeck_common::error::{CommonError, CommonResult};
use flightdeck_common::storage::KeyValueStore;
use flightdeck_common::EventBus;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, instrument, warn};

use super::events::SchedulerEvent;
use super::types::TaskMetadata;

/// Persistence format version
const PERSISTENCE_VERSION: u32 = 1;

/// Document stored under the persistence key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<TaskMetadata>,
}

impl PersistedQueue {
    /// Snapshot `tasks` at the current format version.
    pub fn new(tasks: Vec<TaskMetadata>) -> Self {
        Self { version: PERSISTENCE_VERSION, saved_at: Utc::now(), tasks }
    }

    pub fn to_json(&self) -> CommonResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored snapshot.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON and on snapshots written by another format
    /// version.
    pub fn from_json(json: &str) -> CommonResult<Self> {
        let queue: Self = serde_json::from_str(json)?;
        if queue.version != PERSISTENCE_VERSION {
            return Err(CommonError::serialization_format(
                "JSON",
                format!("unsupported pending-queue version {}", queue.version),
            ));
        }
        Ok(queue)
    }
}

pub(crate) enum PersistCommand {
    /// Replace the stored document with this pending set.
    Snapshot(Vec<TaskMetadata>),
    /// Delete the stored document, acknowledge, and stop.
    Purge(oneshot::Sender<()>),
}

/// Sending half kept by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistenceHandle {
    pub(crate) fn snapshot(&self, tasks: Vec<TaskMetadata>) {
        if self.tx.send(PersistCommand::Snapshot(tasks)).is_err() {
            debug!("persistence writer stopped; snapshot dropped");
        }
    }

    /// Ask the writer to delete persisted metadata and wait until it has.
    pub(crate) async fn purge(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Purge(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

/// Start the writer on `runtime`.
///
/// The writer first reads whatever an earlier scheduler left under `key`,
/// publishes it through `restored` and a `QueueRestored` event, and only
/// then starts applying snapshots.
pub(crate) fn spawn_writer(
    runtime: &tokio::runtime::Handle,
    store: Arc<dyn KeyValueStore>,
    key: String,
    restored: watch::Sender<Option<Vec<TaskMetadata>>>,
    events: EventBus<SchedulerEvent>,
) -> PersistenceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(run_writer(store, key, rx, restored, events));
    PersistenceHandle { tx }
}

#[instrument(skip_all, fields(key = %key))]
async fn run_writer(
    store: Arc<dyn KeyValueStore>,
    key: String,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    restored: watch::Sender<Option<Vec<TaskMetadata>>>,
    events: EventBus<SchedulerEvent>,
) {
    let tasks = restore(store.as_ref(), &key).await;
    if !tasks.is_empty() {
        info!(count = tasks.len(), "restored pending task metadata");
    }
    let _ = restored.send(Some(tasks.clone()));
    events.publish(SchedulerEvent::QueueRestored { tasks });

    while let Some(command) = rx.recv().await {
        let mut latest = command;
        // Coalesce: skip straight to the newest queued snapshot.
        while let PersistCommand::Snapshot(_) = latest {
            match rx.try_recv() {
                Ok(next) => latest = next,
                Err(_) => break,
            }
        }

        match latest {
            PersistCommand::Snapshot(tasks) => write(store.as_ref(), &key, tasks).await,
            PersistCommand::Purge(ack) => {
                if let Err(err) = store.delete(&key).await {
                    warn!(error = %err, "failed to delete persisted pending metadata");
                } else {
                    debug!("deleted persisted pending metadata");
                }
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn restore(store: &dyn KeyValueStore, key: &str) -> Vec<TaskMetadata> {
    match store.get(key).await {
        Ok(Some(json)) => match PersistedQueue::from_json(&json) {
            Ok(queue) => queue.tasks,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable persisted pending metadata");
                Vec::new()
            }
        },
        Ok(None) => Vec::new(),
        Err(err) => {
            warn!(error = %err, "failed to read persisted pending metadata");
            Vec::new()
        }
    }
}

async fn write(store: &dyn KeyValueStore, key: &str, tasks: Vec<TaskMetadata>) {
    let count = tasks.len();
    let result = match PersistedQueue::new(tasks).to_json() {
        Ok(json) => store.set(key, json).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => debug!(count, "persisted pending metadata"),
        Err(err) => warn!(error = %err, count, "failed to persist pending metadata"),
    }
}
