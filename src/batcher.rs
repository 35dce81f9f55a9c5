//! Chunked fan-out of follow-on work onto the durable runtime.
//!
//! Each chunk's batch-create call and its bulk tracking-row insert form one
//! unit: if either half fails the whole chunk fails and is reported for
//! retry, so every created instance has exactly one tracking row and every
//! tracking row a real instance.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::WorkflowError;
use crate::models::TaskRun;
use crate::providers::{TaskRuntime, TaskSpec};
use crate::store::StoreHandle;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

pub struct TaskBatcher {
    chunk_size: usize,
}

impl Default for TaskBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl TaskBatcher {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self { chunk_size }
    }

    /// Create one workflow instance per spec, in fixed-size chunks, and
    /// persist a tracking row per created instance. Returns the number of
    /// instances dispatched.
    ///
    /// Chunks already committed stay committed when a later chunk fails;
    /// the error names the failing chunk so the caller (or the durable
    /// substrate) can resume from it. Instance ids are caller-supplied, so
    /// re-submitting a chunk is idempotent on the runtime side.
    pub async fn dispatch(
        &self,
        runtime: &dyn TaskRuntime,
        store: &StoreHandle,
        project_id: &str,
        requested_by: &str,
        specs: &[TaskSpec],
    ) -> Result<usize, WorkflowError> {
        let mut dispatched = 0usize;

        for (chunk_index, chunk) in specs.chunks(self.chunk_size).enumerate() {
            let instances =
                runtime
                    .create_batch(chunk)
                    .await
                    .map_err(|e| WorkflowError::BatchFailed {
                        chunk_index,
                        dispatched,
                        message: format!("batch create failed: {:#}", e),
                    })?;

            let provider = runtime.provider().to_string();
            let now = Utc::now();
            let rows: Vec<TaskRun> = chunk
                .iter()
                .zip(instances.iter())
                .map(|(spec, instance)| TaskRun {
                    id: Uuid::new_v4().to_string(),
                    project_id: project_id.to_string(),
                    requested_by: requested_by.to_string(),
                    external_task_id: instance.id.clone(),
                    provider: provider.clone(),
                    payload: spec.params.clone(),
                    created_at: now,
                })
                .collect();

            let count = rows.len();
            store
                .call(move |s| s.insert_task_runs(&rows))
                .await
                .map_err(|e| WorkflowError::BatchFailed {
                    chunk_index,
                    dispatched,
                    message: format!("task-run insert failed: {:#}", e),
                })?;

            dispatched += count;
            debug!(chunk_index, count, dispatched, "dispatched task chunk");
        }

        Ok(dispatched)
    }
}
