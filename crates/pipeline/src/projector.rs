//! Pure state projector: folds pipeline events into [`PipelineState`].
//!
//! `apply` performs no IO and never mutates its input in place; every handler builds
//! the next state value from the previous one. The dispatch is an exhaustive `match`,
//! so a new `PipelineEvent` variant does not compile until it has a handler here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use runlog_core::{AggregateId, DomainError, DomainResult, Seq};
use runlog_events::EventEnvelope;

use crate::event::{
    PipelineBranched, PipelineCompleted, PipelineEvent, PipelineFailed, PipelinePaused,
    PipelineResumed, PipelineStarted, ResponseReceived, ResponseSelected, StepCompleted,
    StepStarted,
};
use crate::state::{Lineage, PipelineState, PipelineStatus, StepRecord, StepStatus};

/// Apply one event to an optional state, producing the next state.
///
/// The input is left untouched; the result is a fresh value. `seq` is the event's
/// position in the stream and becomes the state's `version` for every event with a
/// projection effect.
pub fn apply(
    state: Option<&PipelineState>,
    aggregate_id: AggregateId,
    seq: Seq,
    event: &PipelineEvent,
) -> DomainResult<Option<PipelineState>> {
    let next = match event {
        PipelineEvent::PipelineStarted(e) => on_started(state, aggregate_id, seq, e)?,
        PipelineEvent::StepStarted(e) => on_step_started(require(state)?, seq, e)?,
        PipelineEvent::ResponseReceived(e) => on_response_received(require(state)?, seq, e)?,
        PipelineEvent::ResponseSelected(e) => on_response_selected(require(state)?, seq, e)?,
        PipelineEvent::StepCompleted(e) => on_step_completed(require(state)?, seq, e)?,
        PipelineEvent::PipelineBranched(e) => on_branched(require(state)?, seq, e),
        // Rewind markers act through the resolver, never on state.
        PipelineEvent::RewindMarker(_) => return Ok(state.cloned()),
        PipelineEvent::PipelinePaused(e) => on_paused(require(state)?, seq, e)?,
        PipelineEvent::PipelineResumed(e) => on_resumed(require(state)?, seq, e)?,
        PipelineEvent::PipelineFailed(e) => on_failed(require(state)?, seq, e)?,
        PipelineEvent::PipelineCompleted(e) => on_completed(require(state)?, seq, e)?,
    };
    Ok(Some(next))
}

fn require(state: Option<&PipelineState>) -> DomainResult<&PipelineState> {
    state.ok_or(DomainError::NotStarted)
}

/// Copy of `state` stamped with the event's position and time.
fn advanced(state: &PipelineState, seq: Seq, occurred_at: DateTime<Utc>) -> PipelineState {
    let mut next = state.clone();
    next.version = seq;
    next.updated_at = occurred_at;
    next
}

fn on_started(
    state: Option<&PipelineState>,
    aggregate_id: AggregateId,
    seq: Seq,
    e: &PipelineStarted,
) -> DomainResult<PipelineState> {
    if state.is_some() {
        return Err(DomainError::AlreadyStarted);
    }
    if e.pipeline.trim().is_empty() {
        return Err(DomainError::validation("pipeline name cannot be empty"));
    }
    if e.steps.is_empty() {
        return Err(DomainError::validation("step plan cannot be empty"));
    }
    for (i, step) in e.steps.iter().enumerate() {
        if step.trim().is_empty() {
            return Err(DomainError::validation(format!("step {i} has an empty name")));
        }
        if e.steps[..i].contains(step) {
            return Err(DomainError::validation(format!("step '{step}' listed twice")));
        }
    }

    Ok(PipelineState {
        id: aggregate_id,
        pipeline: e.pipeline.clone(),
        status: PipelineStatus::Initializing,
        plan: e.steps.clone(),
        current_step: e.steps.first().cloned(),
        steps: Default::default(),
        lineage: None,
        last_error: None,
        version: seq,
        started_at: e.occurred_at,
        updated_at: e.occurred_at,
    })
}

fn ensure_accepts_step_work(state: &PipelineState) -> DomainResult<()> {
    match state.status {
        PipelineStatus::Completed => Err(DomainError::transition("pipeline already completed")),
        PipelineStatus::Paused => Err(DomainError::transition("pipeline is paused")),
        _ => Ok(()),
    }
}

/// The record of `step` if it is the active, running step.
fn active_record<'a>(state: &'a PipelineState, step: &str) -> DomainResult<&'a StepRecord> {
    if state.status != PipelineStatus::Running {
        return Err(DomainError::transition(format!(
            "pipeline is {:?}, not running",
            state.status
        )));
    }
    if state.current_step.as_deref() != Some(step) {
        return Err(DomainError::transition(format!("step '{step}' is not the active step")));
    }
    match state.steps.get(step) {
        Some(record) if record.status == StepStatus::Running => Ok(record),
        _ => Err(DomainError::transition(format!("step '{step}' is not running"))),
    }
}

fn on_step_started(state: &PipelineState, seq: Seq, e: &StepStarted) -> DomainResult<PipelineState> {
    ensure_accepts_step_work(state)?;
    if !state.in_plan(&e.step) {
        return Err(DomainError::validation(format!("step '{}' is not in the plan", e.step)));
    }
    if let Some(current) = state.current_step.as_deref() {
        if current != e.step && state.step_status(current) == StepStatus::Running {
            return Err(DomainError::transition(format!("step '{current}' is still running")));
        }
    }

    let record = match state.steps.get(&e.step) {
        None => StepRecord {
            status: StepStatus::Running,
            responses: Vec::new(),
            selected: None,
            output: None,
            attempts: 1,
        },
        Some(prev) if prev.status == StepStatus::Running => {
            return Err(DomainError::transition(format!("step '{}' already running", e.step)));
        }
        // Regenerate: keep earlier responses for audit, clear the decision.
        Some(prev) => StepRecord {
            status: StepStatus::Running,
            responses: prev.responses.clone(),
            selected: None,
            output: None,
            attempts: prev.attempts + 1,
        },
    };

    let mut next = advanced(state, seq, e.occurred_at);
    next.steps.insert(e.step.clone(), record);
    next.status = PipelineStatus::Running;
    next.current_step = Some(e.step.clone());
    next.last_error = None;
    Ok(next)
}

fn on_response_received(
    state: &PipelineState,
    seq: Seq,
    e: &ResponseReceived,
) -> DomainResult<PipelineState> {
    let prev = active_record(state, &e.step)?;

    let mut responses = prev.responses.clone();
    responses.push(e.response.clone());
    let record = StepRecord {
        responses,
        ..prev.clone()
    };

    let mut next = advanced(state, seq, e.occurred_at);
    next.steps.insert(e.step.clone(), record);
    Ok(next)
}

fn on_response_selected(
    state: &PipelineState,
    seq: Seq,
    e: &ResponseSelected,
) -> DomainResult<PipelineState> {
    let prev = active_record(state, &e.step)?;
    if e.index >= prev.responses.len() {
        return Err(DomainError::validation(format!(
            "response {} selected but step '{}' has {} responses",
            e.index,
            e.step,
            prev.responses.len()
        )));
    }

    let record = StepRecord {
        status: StepStatus::Completed,
        selected: Some(e.index),
        ..prev.clone()
    };
    Ok(finalize(state, &e.step, record, seq, e.occurred_at))
}

fn on_step_completed(
    state: &PipelineState,
    seq: Seq,
    e: &StepCompleted,
) -> DomainResult<PipelineState> {
    // A step already finalized by a selection may still be marked completed to
    // attach its output; the plan does not advance a second time.
    if let Some(prev) = state.steps.get(&e.step) {
        if prev.status == StepStatus::Completed && state.status == PipelineStatus::Running {
            let record = StepRecord {
                output: e.output.clone().or_else(|| prev.output.clone()),
                ..prev.clone()
            };
            let mut next = advanced(state, seq, e.occurred_at);
            next.steps.insert(e.step.clone(), record);
            return Ok(next);
        }
    }

    let prev = active_record(state, &e.step)?;
    let record = StepRecord {
        status: StepStatus::Completed,
        output: e.output.clone(),
        ..prev.clone()
    };
    Ok(finalize(state, &e.step, record, seq, e.occurred_at))
}

fn finalize(
    state: &PipelineState,
    step: &str,
    record: StepRecord,
    seq: Seq,
    occurred_at: DateTime<Utc>,
) -> PipelineState {
    let mut next = advanced(state, seq, occurred_at);
    next.steps.insert(step.to_string(), record);
    next.current_step = state.step_after(step);
    next
}

fn on_branched(state: &PipelineState, seq: Seq, e: &PipelineBranched) -> PipelineState {
    let mut next = advanced(state, seq, e.occurred_at);
    next.lineage = Some(Lineage {
        parent_id: e.parent_id,
        branch_point_seq: e.branch_point_seq,
        name: e.name.clone(),
    });
    next
}

fn on_paused(state: &PipelineState, seq: Seq, e: &PipelinePaused) -> DomainResult<PipelineState> {
    if state.status != PipelineStatus::Running {
        return Err(DomainError::transition(format!("cannot pause a {:?} pipeline", state.status)));
    }
    let mut next = advanced(state, seq, e.occurred_at);
    next.status = PipelineStatus::Paused;
    Ok(next)
}

fn on_resumed(state: &PipelineState, seq: Seq, e: &PipelineResumed) -> DomainResult<PipelineState> {
    if !matches!(state.status, PipelineStatus::Paused | PipelineStatus::Error) {
        return Err(DomainError::transition(format!("cannot resume a {:?} pipeline", state.status)));
    }
    let mut next = advanced(state, seq, e.occurred_at);
    next.status = PipelineStatus::Running;
    next.last_error = None;
    Ok(next)
}

fn on_failed(state: &PipelineState, seq: Seq, e: &PipelineFailed) -> DomainResult<PipelineState> {
    if !matches!(state.status, PipelineStatus::Initializing | PipelineStatus::Running) {
        return Err(DomainError::transition(format!("cannot fail a {:?} pipeline", state.status)));
    }
    let mut next = advanced(state, seq, e.occurred_at);
    next.status = PipelineStatus::Error;
    next.last_error = Some(match &e.step {
        Some(step) => format!("{step}: {}", e.error),
        None => e.error.clone(),
    });
    Ok(next)
}

fn on_completed(state: &PipelineState, seq: Seq, e: &PipelineCompleted) -> DomainResult<PipelineState> {
    if state.status != PipelineStatus::Running {
        return Err(DomainError::transition(format!("cannot complete a {:?} pipeline", state.status)));
    }
    if !state.all_steps_completed() {
        return Err(DomainError::transition("not every step of the plan is completed"));
    }
    let mut next = advanced(state, seq, e.occurred_at);
    next.status = PipelineStatus::Completed;
    next.current_step = None;
    Ok(next)
}

/// Counters describing one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Events folded into the state (rewind markers included).
    pub applied: u64,
    /// Events of a type this build does not know.
    pub skipped_unknown: u64,
    /// Events of a known type whose payload could not be decoded.
    pub skipped_malformed: u64,
    /// Decoded events the projector refused (lifecycle violations in stored history).
    pub skipped_rejected: u64,
    /// Sequence number of the last event fed, applied or not.
    pub last_seq: Seq,
}

impl ReplayReport {
    pub fn skipped(&self) -> u64 {
        self.skipped_unknown + self.skipped_malformed + self.skipped_rejected
    }
}

/// Incremental fold over persisted envelopes.
///
/// Best effort: an envelope that cannot be decoded or
/// applied is skipped with a warning and counted, the fold carries on.
#[derive(Debug, Clone)]
pub struct Replay {
    aggregate_id: AggregateId,
    state: Option<PipelineState>,
    report: ReplayReport,
}

impl Replay {
    /// Start from the empty state (genesis).
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            state: None,
            report: ReplayReport::default(),
        }
    }

    /// Start from a snapshot baseline folded through `through_seq`.
    pub fn from_baseline(aggregate_id: AggregateId, baseline: PipelineState, through_seq: Seq) -> Self {
        Self {
            aggregate_id,
            state: Some(baseline),
            report: ReplayReport {
                last_seq: through_seq,
                ..ReplayReport::default()
            },
        }
    }

    pub fn feed(&mut self, envelope: &EventEnvelope<JsonValue>) {
        let seq = envelope.sequence_number();
        self.report.last_seq = seq;

        let event = match PipelineEvent::decode(envelope.event_type(), envelope.payload()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(
                    aggregate_id = %self.aggregate_id,
                    seq,
                    event_type = envelope.event_type(),
                    "skipping unknown event type during replay"
                );
                self.report.skipped_unknown += 1;
                return;
            }
            Err(err) => {
                warn!(
                    aggregate_id = %self.aggregate_id,
                    seq,
                    event_type = envelope.event_type(),
                    error = %err,
                    "skipping undecodable event payload during replay"
                );
                self.report.skipped_malformed += 1;
                return;
            }
        };

        match apply(self.state.as_ref(), self.aggregate_id, seq, &event) {
            Ok(next) => {
                self.state = next;
                self.report.applied += 1;
            }
            Err(err) => {
                warn!(
                    aggregate_id = %self.aggregate_id,
                    seq,
                    event_type = envelope.event_type(),
                    error = %err,
                    "skipping event rejected by the projector during replay"
                );
                self.report.skipped_rejected += 1;
            }
        }
    }

    pub fn state(&self) -> Option<&PipelineState> {
        self.state.as_ref()
    }

    pub fn report(&self) -> ReplayReport {
        self.report
    }

    pub fn finish(self) -> (Option<PipelineState>, ReplayReport) {
        (self.state, self.report)
    }
}

/// Fold a full event sequence from genesis.
pub fn reconstruct<'a, I>(aggregate_id: AggregateId, events: I) -> (Option<PipelineState>, ReplayReport)
where
    I: IntoIterator<Item = &'a EventEnvelope<JsonValue>>,
{
    let mut replay = Replay::new(aggregate_id);
    for envelope in events {
        replay.feed(envelope);
    }
    replay.finish()
}
