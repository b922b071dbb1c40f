//! Checkpointing: suspend/resume snapshots for workflow runs.
//!
//! A [`RunCheckpoint`] captures everything needed to rebuild a run's
//! next-superstep state: the pending delivery queue, partially filled
//! fan-in buffers, and still-outstanding external requests, all in portable
//! (serialized) form. Resuming from a checkpoint reproduces the identical
//! queue and request set the live run had at suspend time. That equality
//! is the correctness property durable execution rests on.
//!
//! Storage backends implement [`Checkpointer`]; the crate ships an
//! in-memory backend for tests and a file backend with atomic writes and
//! optional compression. Durable stores beyond that consume the same
//! payload contract.

mod file;

pub use file::FileCheckpointer;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::message::PortableMessage;
use crate::request::RequestId;

/// Serialized form of an outstanding external request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableRequest {
    pub id: RequestId,
    pub port: String,
    pub sink: String,
    pub response_type: String,
    pub payload: Option<PortableMessage>,
}

/// Serialized state of one fan-in edge's accumulation buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInSnapshot {
    /// Index of the edge in the workflow's edge list.
    pub edge_index: usize,
    /// Per-source buffered messages awaiting a complete generation.
    pub pending: BTreeMap<String, Vec<PortableMessage>>,
    /// Sources already seen in the current `Any` generation.
    pub seen: Vec<String>,
}

/// Snapshot of a run taken at a superstep boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// The run this checkpoint belongs to.
    pub run_id: String,

    /// Superstep number at capture time.
    pub superstep: usize,

    /// Queued-but-undelivered messages, keyed by target executor.
    pub pending: BTreeMap<String, Vec<PortableMessage>>,

    /// Fan-in buffers that were partially filled at capture time.
    pub fan_in: Vec<FanInSnapshot>,

    /// Requests still awaiting a response.
    pub outstanding: Vec<PortableRequest>,

    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,

    /// Free-form metadata for external tools.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RunCheckpoint {
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Total queued messages across all executors.
    pub fn pending_message_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.fan_in.is_empty() && self.outstanding.is_empty()
    }
}

/// Durable storage for run checkpoints, keyed by superstep.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Save a checkpoint. Implementations should write atomically.
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), WorkflowError>;

    /// Load the checkpoint taken at `superstep`, if any.
    async fn load(&self, superstep: usize) -> Result<Option<RunCheckpoint>, WorkflowError>;

    /// Load the most recent checkpoint.
    async fn latest(&self) -> Result<Option<RunCheckpoint>, WorkflowError>;

    /// All stored checkpoint supersteps, ascending.
    async fn list(&self) -> Result<Vec<usize>, WorkflowError>;

    /// Delete the checkpoint at `superstep`.
    async fn delete(&self, superstep: usize) -> Result<(), WorkflowError>;

    /// Keep only the `keep` most recent checkpoints; returns how many were
    /// deleted.
    async fn prune(&self, keep: usize) -> Result<usize, WorkflowError> {
        let checkpoints = self.list().await?;
        let to_delete = checkpoints.len().saturating_sub(keep);
        let mut deleted = 0;
        for superstep in checkpoints.into_iter().take(to_delete) {
            self.delete(superstep).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Remove every stored checkpoint.
    async fn clear(&self) -> Result<(), WorkflowError> {
        for superstep in self.list().await? {
            self.delete(superstep).await?;
        }
        Ok(())
    }
}

/// In-memory checkpointer. Not durable; for tests and development.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    checkpoints: tokio::sync::RwLock<BTreeMap<usize, RunCheckpoint>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), WorkflowError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.superstep, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, superstep: usize) -> Result<Option<RunCheckpoint>, WorkflowError> {
        Ok(self.checkpoints.read().await.get(&superstep).cloned())
    }

    async fn latest(&self) -> Result<Option<RunCheckpoint>, WorkflowError> {
        Ok(self
            .checkpoints
            .read()
            .await
            .last_key_value()
            .map(|(_, checkpoint)| checkpoint.clone()))
    }

    async fn list(&self) -> Result<Vec<usize>, WorkflowError> {
        Ok(self.checkpoints.read().await.keys().copied().collect())
    }

    async fn delete(&self, superstep: usize) -> Result<(), WorkflowError> {
        self.checkpoints.write().await.remove(&superstep);
        Ok(())
    }
}
