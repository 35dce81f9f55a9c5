//! Typed error hierarchy for the workflow core.
//!
//! The durable-execution substrate owns the retry loop; this crate only
//! classifies each failure as retryable or not via
//! [`WorkflowError::is_retryable`]. The two absorption cases from the error
//! design (a degraded per-draft metrics query, a stale candidate reference)
//! never become a `WorkflowError` — they are handled in place with a zero
//! placeholder or a skipped decision.

use thiserror::Error;

/// Errors surfaced at a workflow step boundary.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// An entity id did not resolve. Retrying will never help.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A snapshot was requested for a phase that has no content attached.
    #[error("Phase {phase_id} has no content to snapshot")]
    EmptyPhaseScope { phase_id: String },

    /// Another phase generation holds the per-strategy lock.
    #[error("Strategy {strategy_id} is locked by a concurrent phase generation")]
    StrategyLocked { strategy_id: String },

    /// The reasoning service failed or returned output that did not parse.
    #[error("Reasoning service failed: {0}")]
    Reasoning(String),

    /// The durable runtime rejected an instance-creation call.
    #[error("Task runtime error: {0}")]
    Runtime(String),

    /// A batch chunk failed before both halves committed; the whole chunk
    /// must be retried.
    #[error("Batch chunk {chunk_index} failed ({dispatched} tasks dispatched so far): {message}")]
    BatchFailed {
        chunk_index: usize,
        dispatched: usize,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Whether the durable substrate should re-run the failing step.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::EmptyPhaseScope { .. } => false,
            Self::StrategyLocked { .. }
            | Self::Reasoning(_)
            | Self::Runtime(_)
            | Self::BatchFailed { .. }
            | Self::Database(_)
            | Self::Other(_) => true,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Errors from the pure metrics-blending functions.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The lookback range must be exactly 7, 28, or 90 days.
    #[error("Unsupported lookback range: {days} days (expected 7, 28, or 90)")]
    UnsupportedLookback { days: u32 },
}
