//! services/api/src/pipeline/mod.rs
//!
//! The course generation pipeline: interview, structure planning, per-module
//! generation, assembly and the orchestrator that sequences them. Stages
//! return owned values which the orchestrator applies to the aggregate; no
//! stage mutates shared state behind the orchestrator's back.

pub mod assembly;
pub mod interview;
pub mod module_builder;
pub mod orchestrator;
pub mod planner;

#[cfg(test)]
pub(crate) mod test_support;

use courseforge_core::domain::InvariantViolation;
use courseforge_core::ports::PortError;

use crate::llm::GenerationError;

pub use interview::{InterviewManager, InterviewTurn};
pub use module_builder::ModulePipeline;
pub use orchestrator::{GenerationCommand, GenerationOutcome, Orchestrator};

/// Anything that can sink a pipeline run. The orchestrator converts these
/// into a FAILED status plus a human-readable reason; they are never shown
/// to the end user as a stack trace.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("pipeline deadline exceeded")]
    DeadlineExceeded,
}
