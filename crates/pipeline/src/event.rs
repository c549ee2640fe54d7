use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runlog_core::{AggregateId, Seq};
use runlog_events::Event;

pub const PIPELINE_STARTED: &str = "pipeline.started";
pub const STEP_STARTED: &str = "pipeline.step_started";
pub const RESPONSE_RECEIVED: &str = "pipeline.response_received";
pub const RESPONSE_SELECTED: &str = "pipeline.response_selected";
pub const STEP_COMPLETED: &str = "pipeline.step_completed";
pub const PIPELINE_BRANCHED: &str = "pipeline.branched";
pub const REWIND_MARKER: &str = "pipeline.rewind_marker";
pub const PIPELINE_PAUSED: &str = "pipeline.paused";
pub const PIPELINE_RESUMED: &str = "pipeline.resumed";
pub const PIPELINE_FAILED: &str = "pipeline.failed";
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";

/// Event types a rewind may target: points where no step is half-done.
pub const STEP_BOUNDARY_TYPES: [&str; 2] = [PIPELINE_STARTED, STEP_COMPLETED];

/// Output of one model invocation, produced elsewhere and stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub raw_output: String,
    #[serde(default)]
    pub usage: JsonValue,
    #[serde(default)]
    pub timing: JsonValue,
}

/// Event: PipelineStarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStarted {
    /// Pipeline kind (e.g. "article").
    pub pipeline: String,
    /// Ordered step plan (e.g. angles → outline → draft → polish).
    pub steps: Vec<String>,
    #[serde(default)]
    pub input: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StepStarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStarted {
    pub step: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ResponseReceived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseReceived {
    pub step: String,
    pub response: LlmResponse,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ResponseSelected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSelected {
    pub step: String,
    /// Index into the step's received responses.
    pub index: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StepCompleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompleted {
    pub step: String,
    #[serde(default)]
    pub output: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PipelineBranched (first own event of a branch aggregate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineBranched {
    pub parent_id: AggregateId,
    pub branch_point_seq: Seq,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RewindMarker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindMarker {
    pub horizon_seq: Seq,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PipelinePaused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePaused {
    #[serde(default)]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PipelineResumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResumed {
    pub occurred_at: DateTime<Utc>,
}

/// Event: PipelineFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineFailed {
    #[serde(default)]
    pub step: Option<String>,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PipelineCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCompleted {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PipelineStarted(PipelineStarted),
    StepStarted(StepStarted),
    ResponseReceived(ResponseReceived),
    ResponseSelected(ResponseSelected),
    StepCompleted(StepCompleted),
    PipelineBranched(PipelineBranched),
    RewindMarker(RewindMarker),
    PipelinePaused(PipelinePaused),
    PipelineResumed(PipelineResumed),
    PipelineFailed(PipelineFailed),
    PipelineCompleted(PipelineCompleted),
}

impl PipelineEvent {
    /// Decode a persisted payload.
    ///
    /// Returns `Ok(None)` for event types this build does not know, so replay can skip
    /// them; a known type with a malformed body is an `Err`.
    pub fn decode(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, serde_json::Error> {
        fn body<T: serde::de::DeserializeOwned>(payload: &JsonValue) -> Result<T, serde_json::Error> {
            T::deserialize(payload)
        }

        let event = match event_type {
            PIPELINE_STARTED => Self::PipelineStarted(body(payload)?),
            STEP_STARTED => Self::StepStarted(body(payload)?),
            RESPONSE_RECEIVED => Self::ResponseReceived(body(payload)?),
            RESPONSE_SELECTED => Self::ResponseSelected(body(payload)?),
            STEP_COMPLETED => Self::StepCompleted(body(payload)?),
            PIPELINE_BRANCHED => Self::PipelineBranched(body(payload)?),
            REWIND_MARKER => Self::RewindMarker(body(payload)?),
            PIPELINE_PAUSED => Self::PipelinePaused(body(payload)?),
            PIPELINE_RESUMED => Self::PipelineResumed(body(payload)?),
            PIPELINE_FAILED => Self::PipelineFailed(body(payload)?),
            PIPELINE_COMPLETED => Self::PipelineCompleted(body(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Whether this event is only ever appended by the history store itself
    /// (rewind and branch operations), never by callers directly.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::PipelineBranched(_) | Self::RewindMarker(_))
    }
}

impl Event for PipelineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineStarted(_) => PIPELINE_STARTED,
            PipelineEvent::StepStarted(_) => STEP_STARTED,
            PipelineEvent::ResponseReceived(_) => RESPONSE_RECEIVED,
            PipelineEvent::ResponseSelected(_) => RESPONSE_SELECTED,
            PipelineEvent::StepCompleted(_) => STEP_COMPLETED,
            PipelineEvent::PipelineBranched(_) => PIPELINE_BRANCHED,
            PipelineEvent::RewindMarker(_) => REWIND_MARKER,
            PipelineEvent::PipelinePaused(_) => PIPELINE_PAUSED,
            PipelineEvent::PipelineResumed(_) => PIPELINE_RESUMED,
            PipelineEvent::PipelineFailed(_) => PIPELINE_FAILED,
            PipelineEvent::PipelineCompleted(_) => PIPELINE_COMPLETED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::PipelineStarted(e) => e.occurred_at,
            PipelineEvent::StepStarted(e) => e.occurred_at,
            PipelineEvent::ResponseReceived(e) => e.occurred_at,
            PipelineEvent::ResponseSelected(e) => e.occurred_at,
            PipelineEvent::StepCompleted(e) => e.occurred_at,
            PipelineEvent::PipelineBranched(e) => e.occurred_at,
            PipelineEvent::RewindMarker(e) => e.occurred_at,
            PipelineEvent::PipelinePaused(e) => e.occurred_at,
            PipelineEvent::PipelineResumed(e) => e.occurred_at,
            PipelineEvent::PipelineFailed(e) => e.occurred_at,
            PipelineEvent::PipelineCompleted(e) => e.occurred_at,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            PipelineEvent::PipelineStarted(e) => serde_json::to_value(e),
            PipelineEvent::StepStarted(e) => serde_json::to_value(e),
            PipelineEvent::ResponseReceived(e) => serde_json::to_value(e),
            PipelineEvent::ResponseSelected(e) => serde_json::to_value(e),
            PipelineEvent::StepCompleted(e) => serde_json::to_value(e),
            PipelineEvent::PipelineBranched(e) => serde_json::to_value(e),
            PipelineEvent::RewindMarker(e) => serde_json::to_value(e),
            PipelineEvent::PipelinePaused(e) => serde_json::to_value(e),
            PipelineEvent::PipelineResumed(e) => serde_json::to_value(e),
            PipelineEvent::PipelineFailed(e) => serde_json::to_value(e),
            PipelineEvent::PipelineCompleted(e) => serde_json::to_value(e),
        }
    }
}
