//! Pipeline state machine
//!
//! Owned by one orchestrator run. Every mutation goes through a transition
//! function; the visited-stage history is append-only and the retry count
//! never passes its ceiling.

use crate::error::OrchestrationError;
use crate::models::{FailureKind, PipelineFailure, PipelineStage, TemporalViolation};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// What `retry` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back in `planning`; carries the new retry count.
    Replan(u32),
    /// The state is now `failed`.
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    query_id: Uuid,
    stage: PipelineStage,
    history: Vec<PipelineStage>,
    retry_count: u32,
    max_retries: u32,
    failure: Option<PipelineFailure>,
    /// Violations from the most recent temporal analysis.
    temporal_violations: Vec<TemporalViolation>,
    plan_id: Option<Uuid>,
    execution_ids: Vec<Uuid>,
    fact_id: Option<Uuid>,
    blocked_fingerprints: BTreeSet<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// Legal non-failure edges. `failed` is reachable from any non-terminal stage.
fn is_allowed(from: PipelineStage, to: PipelineStage) -> bool {
    use PipelineStage::*;

    if to == Failed {
        return !from.is_terminal();
    }

    matches!(
        (from, to),
        (Initialized, Planning)
            | (Planning, Planning)
            | (Planning, Fetching)
            | (Planning, Executing)
            | (Fetching, Executing)
            | (Fetching, Planning)
            | (Executing, Validating)
            | (Executing, Planning)
            | (Validating, Debating)
            | (Debating, Completed)
    )
}

impl PipelineState {
    pub fn new(query_id: Uuid, max_retries: u32) -> Self {
        Self {
            query_id,
            stage: PipelineStage::Initialized,
            history: vec![PipelineStage::Initialized],
            retry_count: 0,
            max_retries,
            failure: None,
            temporal_violations: Vec::new(),
            plan_id: None,
            execution_ids: Vec::new(),
            fact_id: None,
            blocked_fingerprints: BTreeSet::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn history(&self) -> &[PipelineStage] {
        &self.history
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        self.failure.as_ref()
    }

    pub fn temporal_violations(&self) -> &[TemporalViolation] {
        &self.temporal_violations
    }

    pub fn plan_id(&self) -> Option<Uuid> {
        self.plan_id
    }

    pub fn execution_ids(&self) -> &[Uuid] {
        &self.execution_ids
    }

    pub fn fact_id(&self) -> Option<Uuid> {
        self.fact_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Move to `to`, appending it to the history.
    pub fn transition(&mut self, to: PipelineStage) -> Result<()> {
        if !is_allowed(self.stage, to) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.stage,
                to,
            });
        }

        debug!(query_id = %self.query_id, from = %self.stage, to = %to, "Pipeline transition");
        self.stage = to;
        self.history.push(to);
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Go back to `planning` after a failed attempt, or fail for good.
    ///
    /// Non-retryable kinds fail immediately. Once the ceiling is reached
    /// the state fails with `retry_limit_exceeded`.
    pub fn retry(&mut self, kind: FailureKind, reason: &str) -> RetryDecision {
        if self.is_terminal() {
            return RetryDecision::Exhausted;
        }

        if !kind.is_retryable() {
            self.fail(kind, reason);
            return RetryDecision::Exhausted;
        }

        if self.retry_count >= self.max_retries {
            self.fail(
                FailureKind::RetryLimitExceeded,
                &format!(
                    "gave up after {} retries; last failure {}: {}",
                    self.retry_count, kind, reason
                ),
            );
            return RetryDecision::Exhausted;
        }

        if self.transition(PipelineStage::Planning).is_err() {
            self.fail(kind, reason);
            return RetryDecision::Exhausted;
        }

        self.retry_count += 1;
        warn!(
            query_id = %self.query_id,
            retry = self.retry_count,
            max = self.max_retries,
            kind = %kind,
            "Re-planning after failed attempt"
        );
        RetryDecision::Replan(self.retry_count)
    }

    /// Terminal failure. No-op once terminal.
    pub fn fail(&mut self, kind: FailureKind, reason: &str) {
        if self.is_terminal() {
            return;
        }

        warn!(query_id = %self.query_id, stage = %self.stage, kind = %kind, reason, "Pipeline failed");
        self.failure = Some(PipelineFailure {
            stage: self.stage,
            kind,
            reason: reason.to_string(),
        });
        self.stage = PipelineStage::Failed;
        self.history.push(PipelineStage::Failed);
        self.finished_at = Some(Utc::now());
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(PipelineStage::Completed)
    }

    pub fn set_plan(&mut self, plan_id: Uuid) {
        self.plan_id = Some(plan_id);
    }

    pub fn record_execution(&mut self, execution_id: Uuid) {
        self.execution_ids.push(execution_id);
    }

    pub fn set_fact(&mut self, fact_id: Uuid) {
        self.fact_id = Some(fact_id);
    }

    pub fn set_temporal_violations(&mut self, violations: Vec<TemporalViolation>) {
        self.temporal_violations = violations;
    }

    /// Remember a fingerprint that must never run. Returns false if it was
    /// already known.
    pub fn mark_blocked(&mut self, fingerprint: &str) -> bool {
        self.blocked_fingerprints.insert(fingerprint.to_string())
    }

    pub fn was_blocked(&self, fingerprint: &str) -> bool {
        self.blocked_fingerprints.contains(fingerprint)
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}
