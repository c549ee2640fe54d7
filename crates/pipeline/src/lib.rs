//! Pipeline-run domain module (event-sourced).
//!
//! This crate contains the events of a multi-step LLM pipeline run, the state they
//! reconstruct, and the pure projector folding one into the other (no IO, no storage).

pub mod event;
pub mod projector;
pub mod state;

pub use event::{
    LlmResponse, PipelineBranched, PipelineCompleted, PipelineEvent, PipelineFailed,
    PipelinePaused, PipelineResumed, PipelineStarted, ResponseReceived, ResponseSelected,
    RewindMarker, StepCompleted, StepStarted, STEP_BOUNDARY_TYPES,
};
pub use projector::{Replay, ReplayReport, apply, reconstruct};
pub use state::{Lineage, PipelineState, PipelineStatus, StepRecord, StepStatus};
