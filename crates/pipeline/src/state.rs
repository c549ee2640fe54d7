use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use runlog_core::{AggregateId, AggregateRoot, Seq};

use crate::event::LlmResponse;

/// Lifecycle of a pipeline run.
///
/// `Initializing → Running → {Paused ⇄ Running, Completed, Error → Running}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Error,
}

/// Lifecycle of one step: `Pending → Running → Completed → Running` (regenerate).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
}

/// Per-step sub-record. Replaced wholesale on every change, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub responses: Vec<LlmResponse>,
    pub selected: Option<usize>,
    pub output: Option<JsonValue>,
    /// How many times the step was started (regenerations included).
    pub attempts: u32,
}

impl StepRecord {
    pub fn selected_response(&self) -> Option<&LlmResponse> {
        self.selected.and_then(|i| self.responses.get(i))
    }
}

/// Where a branch aggregate forked from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent_id: AggregateId,
    pub branch_point_seq: Seq,
    pub name: String,
}

/// Reconstructed state of one pipeline run (or branch).
///
/// Derived data only: rebuilt from the event stream, cached and snapshotted, but the
/// stream stays the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub(crate) id: AggregateId,
    pub(crate) pipeline: String,
    pub(crate) status: PipelineStatus,
    pub(crate) plan: Vec<String>,
    pub(crate) current_step: Option<String>,
    pub(crate) steps: BTreeMap<String, StepRecord>,
    pub(crate) lineage: Option<Lineage>,
    pub(crate) last_error: Option<String>,
    pub(crate) version: Seq,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Record of a step that has been touched; `None` if it never started.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Status of any step of the plan; untouched steps report `Pending`.
    pub fn step_status(&self, name: &str) -> StepStatus {
        self.steps
            .get(name)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn steps(&self) -> &BTreeMap<String, StepRecord> {
        &self.steps
    }

    pub fn lineage(&self) -> Option<&Lineage> {
        self.lineage.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Plan step that follows `step`, if any.
    pub(crate) fn step_after(&self, step: &str) -> Option<String> {
        self.plan
            .iter()
            .position(|s| s == step)
            .and_then(|i| self.plan.get(i + 1))
            .cloned()
    }

    pub(crate) fn in_plan(&self, step: &str) -> bool {
        self.plan.iter().any(|s| s == step)
    }

    pub(crate) fn all_steps_completed(&self) -> bool {
        self.plan
            .iter()
            .all(|s| self.step_status(s) == StepStatus::Completed)
    }
}

impl AggregateRoot for PipelineState {
    fn id(&self) -> AggregateId {
        self.id
    }

    fn version(&self) -> Seq {
        self.version
    }
}
