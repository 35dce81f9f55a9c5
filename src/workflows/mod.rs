//! Durable workflow definitions. Each workflow is a sequence of steps
//! executed by an external durable runtime; steps communicate only
//! through persisted state.

pub mod phase_generation;
pub mod snapshot;

pub use phase_generation::{PhaseGenerationInput, PhaseGenerationOutput, PhaseGenerationWorkflow};
pub use snapshot::{SnapshotInput, SnapshotOutput, SnapshotWorkflow};
