//! Pipeline orchestrator
//!
//! PLAN → FETCH? → EXECUTE (temporal, sandbox, extraction) → VALIDATE → DEBATE → COMPLETE
//!
//! Anticipated failures end up as typed outcomes on `PipelineState`. The
//! only way a number leaves this module is inside a `VerifiedAnswer`, which
//! carries the `VerifiedFact` it came from.

use crate::audit::{compute_fingerprint, AuditLog, InMemoryLineageStore, LineageEntry, LineageEvent, LineageStore};
use crate::config::PipelineConfig;
use crate::data::{DataFetcher, Dataset};
use crate::debate::{
    DebateEngine, GeminiPerspectiveProvider, HeuristicPerspectiveProvider, PerspectiveProvider,
    PerspectiveRequest,
};
use crate::execution::{ExecutionSandbox, SlotPool};
use crate::extraction::{ExtractionContext, ExtractionOutcome, FactExtractionGate};
use crate::gemini::GeminiClient;
use crate::models::{
    AnalysisQuery, AuditRecord, DataProvenance, DebateRecord, ExecutionStatus, FactSummary,
    FailureKind, PipelineStage, PlanFeedback, ReviewResult, ReviewVerdict, VerifiedAnswer,
    VerifiedFact,
};
use crate::planner::{GeminiPlanner, MockPlanner, PlanGenerator};
use crate::safety::SafetyScreener;
use crate::state::{PipelineState, RetryDecision};
use crate::temporal::{TemporalAnalyzer, TemporalReport};
use crate::verification::AdversarialReviewer;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;


/// Everything one `run` produced, success or not
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    /// Present only when the pipeline completed.
    pub answer: Option<VerifiedAnswer>,
    pub audit: AuditRecord,
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        self.state.stage() == PipelineStage::Completed
    }
}

/// Result of one plan → fetch → execute → extract attempt
enum Attempt {
    Extracted {
        fact: VerifiedFact,
        program: String,
        temporal: TemporalReport,
    },
    Failed {
        kind: FailureKind,
        reasons: Vec<String>,
        rejected_fingerprint: Option<String>,
    },
    /// The state is already terminal.
    Stopped,
}

impl Attempt {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Attempt::Failed {
            kind,
            reasons: vec![reason.into()],
            rejected_fingerprint: None,
        }
    }
}

/// Per-run bookkeeping that ends up in the audit record
struct RunLedger {
    state: PipelineState,
    lineage: LineageWriter,
    total_cost: f64,
    fact: Option<FactSummary>,
    review: Option<ReviewResult>,
    debate: Option<DebateRecord>,
    degradations: Vec<FailureKind>,
}

impl RunLedger {
    async fn enter(&mut self, stage: PipelineStage) -> Result<()> {
        self.state.transition(stage)?;
        self.lineage.append(LineageEvent::StageEntered { stage }).await;
        Ok(())
    }
}

/// Best-effort lineage writes for one run.
///
/// Each write is bounded by `write_timeout`. After the first write that
/// times out the store is treated as unavailable and the rest of the run's
/// entries are dropped, so a hung store costs one timeout per run.
struct LineageWriter {
    store: Arc<dyn LineageStore>,
    query_id: Uuid,
    write_timeout: Duration,
    stalled: bool,
    dropped: usize,
}

impl LineageWriter {
    fn new(store: Arc<dyn LineageStore>, query_id: Uuid, write_timeout: Duration) -> Self {
        Self {
            store,
            query_id,
            write_timeout,
            stalled: false,
            dropped: 0,
        }
    }

    async fn append(&mut self, event: LineageEvent) {
        if self.stalled {
            self.dropped += 1;
            return;
        }

        let entry = LineageEntry::new(self.query_id, event);
        match timeout(self.write_timeout, self.store.append(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(query_id = %self.query_id, error = %e, "Lineage append failed");
            }
            Err(_) => {
                warn!(
                    query_id = %self.query_id,
                    timeout = ?self.write_timeout,
                    "Lineage store unresponsive, dropping further entries for this run"
                );
                self.stalled = true;
                self.dropped += 1;
            }
        }
    }
}

/// Main orchestrator that sequences one query through the pipeline
pub struct Orchestrator {
    config: PipelineConfig,
    planner: Arc<dyn PlanGenerator>,
    fetcher: DataFetcher,
    screener: SafetyScreener,
    analyzer: TemporalAnalyzer,
    sandbox: ExecutionSandbox,
    gate: FactExtractionGate,
    reviewer: AdversarialReviewer,
    debate: DebateEngine,
    lineage: Arc<dyn LineageStore>,
    audit_log: AuditLog,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        planner: Arc<dyn PlanGenerator>,
        fetcher: DataFetcher,
        perspectives: Arc<dyn PerspectiveProvider>,
    ) -> Self {
        let sandbox = ExecutionSandbox::new(
            config.sandbox.clone(),
            SlotPool::new(config.sandbox_slots),
        );
        let debate = DebateEngine::new(perspectives, config.debate.clone());

        Self {
            config,
            planner,
            fetcher,
            screener: SafetyScreener::new(),
            analyzer: TemporalAnalyzer::new(),
            sandbox,
            gate: FactExtractionGate::new(),
            reviewer: AdversarialReviewer::default(),
            debate,
            lineage: Arc::new(InMemoryLineageStore::new()),
            audit_log: AuditLog::new(),
        }
    }

    /// Wire the Gemini planner and perspectives when a key is configured,
    /// the offline planner and heuristic perspectives otherwise.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let fetcher = DataFetcher::from_configs(&config.data_apis)?;

        let (planner, perspectives): (Arc<dyn PlanGenerator>, Arc<dyn PerspectiveProvider>) =
            match &config.gemini {
                Some(gemini) => {
                    let client = GeminiClient::new(gemini.clone())?;
                    info!(model = %gemini.model, "Using Gemini planner and perspectives");
                    (
                        Arc::new(GeminiPlanner::new(client.clone())),
                        Arc::new(GeminiPerspectiveProvider::new(client)),
                    )
                }
                None => {
                    warn!("GEMINI_API_KEY not set, using offline demo planner and heuristic perspectives");
                    (
                        Arc::new(MockPlanner::demo()),
                        Arc::new(HeuristicPerspectiveProvider::new()),
                    )
                }
            };

        Ok(Self::new(config, planner, fetcher, perspectives))
    }

    pub fn with_reviewer(mut self, reviewer: AdversarialReviewer) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_lineage(mut self, lineage: Arc<dyn LineageStore>) -> Self {
        self.lineage = lineage;
        self
    }

    pub fn with_audit_log(mut self, audit_log: AuditLog) -> Self {
        self.audit_log = audit_log;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    pub fn lineage(&self) -> &Arc<dyn LineageStore> {
        &self.lineage
    }

    /// Run one query to a terminal stage.
    ///
    /// `Err` means a defect (an illegal transition); every anticipated
    /// failure comes back as a failed `PipelineOutcome`.
    pub async fn run(&self, query: AnalysisQuery) -> Result<PipelineOutcome> {
        let deadline = Instant::now() + self.config.deadline;
        let mut ledger = RunLedger {
            state: PipelineState::new(query.query_id, self.config.max_retries),
            lineage: LineageWriter::new(
                Arc::clone(&self.lineage),
                query.query_id,
                self.config.lineage_write_timeout,
            ),
            total_cost: 0.0,
            fact: None,
            review: None,
            debate: None,
            degradations: Vec::new(),
        };

        info!(
            query_id = %query.query_id,
            as_of = ?query.as_of,
            max_retries = self.config.max_retries,
            "Pipeline started"
        );

        ledger.enter(PipelineStage::Planning).await?;

        let mut feedback: Option<PlanFeedback> = None;
        let extracted = loop {
            match self
                .attempt(&query, &mut ledger, feedback.as_ref(), deadline)
                .await?
            {
                Attempt::Extracted {
                    fact,
                    program,
                    temporal,
                } => break Some((fact, program, temporal)),
                Attempt::Stopped => break None,
                Attempt::Failed {
                    kind,
                    reasons,
                    rejected_fingerprint,
                } => match ledger.state.retry(kind, &reasons.join("; ")) {
                    RetryDecision::Replan(attempt) => {
                        ledger.lineage.append(LineageEvent::StageEntered {
                            stage: PipelineStage::Planning,
                        })
                        .await;
                        feedback = Some(PlanFeedback {
                            failure_kind: kind,
                            reasons,
                            rejected_fingerprint,
                            attempt,
                        });
                    }
                    RetryDecision::Exhausted => break None,
                },
            }
        };

        let answer = match extracted {
            Some((fact, program, temporal)) => {
                self.validate_and_debate(&query, &mut ledger, fact, &program, &temporal, deadline)
                    .await?
            }
            None => None,
        };

        Ok(self.finish(&query, ledger, answer).await)
    }

    /// One attempt: plan, optionally fetch, then execute and extract.
    async fn attempt(
        &self,
        query: &AnalysisQuery,
        ledger: &mut RunLedger,
        feedback: Option<&PlanFeedback>,
        deadline: Instant,
    ) -> Result<Attempt> {
        let query_id = query.query_id;

        // === PLAN ===
        let generated = match timeout_at(deadline, self.planner.generate_plan(query, feedback)).await {
            Err(_) => return Ok(self.deadline_exceeded(&mut ledger.state, "planning")),
            Ok(Err(e)) => {
                return Ok(Attempt::failed(FailureKind::PlanGenerationError, e.to_string()));
            }
            Ok(Ok(generated)) => generated,
        };
        ledger.total_cost += generated.usage.cost_usd;

        let plan = generated.plan;
        let program = plan.program();
        let fingerprint = compute_fingerprint(&program);
        ledger.state.set_plan(plan.plan_id);

        debug!(
            query_id = %query_id,
            plan_id = %plan.plan_id,
            fingerprint = %fingerprint,
            blocks = plan.code_blocks.len(),
            requirements = plan.data_requirements.len(),
            "Plan produced"
        );
        ledger.lineage.append(LineageEvent::PlanProduced {
            plan_id: plan.plan_id,
            attempt: ledger.state.retry_count() + 1,
            code_fingerprint: fingerprint.clone(),
            data_requirements: plan.data_requirements.iter().map(|r| r.id.clone()).collect(),
        })
        .await;

        if program.trim().is_empty() {
            return Ok(Attempt::failed(FailureKind::PlanGenerationError, "plan has no code"));
        }

        if ledger.state.was_blocked(&fingerprint) {
            ledger.state.fail(
                FailureKind::RepeatedBlockedCode,
                &format!("plan generator resubmitted blocked code {}", &fingerprint[..12]),
            );
            return Ok(Attempt::Stopped);
        }

        // === FETCH ===
        let datasets: Vec<Dataset> = if plan.needs_data() {
            ledger.enter(PipelineStage::Fetching).await?;
            match timeout_at(deadline, self.fetcher.fetch_all(&plan.data_requirements)).await {
                Err(_) => return Ok(self.deadline_exceeded(&mut ledger.state, "fetching")),
                Ok(Err(e)) => return Ok(Attempt::failed(FailureKind::FetchError, e.to_string())),
                Ok(Ok(datasets)) => datasets,
            }
        } else {
            Vec::new()
        };

        let provenance: Vec<DataProvenance> = datasets.iter().map(Dataset::provenance).collect();
        for p in &provenance {
            ledger.lineage.append(LineageEvent::DataResolved { provenance: p.clone() })
                .await;
        }

        // === EXECUTE ===
        ledger.enter(PipelineStage::Executing).await?;

        let safety = self.screener.screen(&program);
        let temporal = self.analyzer.analyze(&program, query.as_of);
        ledger
            .state
            .set_temporal_violations(temporal.violations.clone());
        ledger.lineage.append(LineageEvent::TemporalAnalyzed {
            code_fingerprint: fingerprint.clone(),
            violations: temporal.violations.clone(),
            blocking: temporal.blocking,
        })
        .await;

        let telemetry = match timeout_at(
            deadline,
            self.sandbox.execute(&program, &datasets, Some(&temporal)),
        )
        .await
        {
            Err(_) => return Ok(self.deadline_exceeded(&mut ledger.state, "executing")),
            Ok(telemetry) => telemetry,
        };

        ledger.state.record_execution(telemetry.execution_id);
        ledger.lineage.append(LineageEvent::Telemetry {
            telemetry: telemetry.clone(),
        })
        .await;

        if telemetry.status == ExecutionStatus::Blocked {
            ledger.state.mark_blocked(&fingerprint);
            let kind = if safety.is_blocked() {
                FailureKind::SafetyBlocked
            } else {
                FailureKind::TemporalBlocked
            };
            return Ok(Attempt::Failed {
                kind,
                reasons: telemetry.block_reasons.clone(),
                rejected_fingerprint: Some(fingerprint),
            });
        }

        // Timeout and error telemetry still go through the gate, which rejects
        // them as execution_failed; the retry is classified by status.
        let execution_failure = match telemetry.status {
            ExecutionStatus::Timeout => Some((
                FailureKind::ExecutionTimeout,
                format!(
                    "execution exceeded {} ms wall clock",
                    self.config.sandbox.timeout_ms
                ),
            )),
            ExecutionStatus::Error => Some((
                FailureKind::ExecutionError,
                format!(
                    "exit code {}: {}",
                    telemetry.exit_code,
                    tail(&telemetry.stderr, 400)
                ),
            )),
            _ => None,
        };

        let ctx = ExtractionContext {
            query_id,
            code: &program,
            provenance: &provenance,
        };

        match self.gate.extract(&telemetry, &ctx) {
            ExtractionOutcome::Extracted { fact, method } => {
                debug!(fact_id = %fact.fact_id(), method = ?method, "Fact extracted");
                ledger.state.set_fact(fact.fact_id());
                ledger.fact = Some(FactSummary::from(&fact));
                ledger.lineage.append(LineageEvent::FactExtracted {
                    fact: FactSummary::from(&fact),
                    execution_id: telemetry.execution_id,
                })
                .await;
                Ok(Attempt::Extracted {
                    fact,
                    program,
                    temporal,
                })
            }
            ExtractionOutcome::Rejected(reason) => {
                ledger.lineage.append(LineageEvent::ExtractionRejected {
                    execution_id: telemetry.execution_id,
                    reason: reason.to_string(),
                })
                .await;
                if let Some((kind, detail)) = execution_failure {
                    return Ok(Attempt::failed(kind, format!("{} ({})", detail, reason)));
                }
                Ok(Attempt::failed(
                    FailureKind::ExtractionRejected,
                    format!(
                        "{}; print exactly one JSON object of numeric results on the last line",
                        reason
                    ),
                ))
            }
        }
    }

    /// Review, then debate. Returns the answer when the pipeline completes.
    async fn validate_and_debate(
        &self,
        query: &AnalysisQuery,
        ledger: &mut RunLedger,
        mut fact: VerifiedFact,
        program: &str,
        temporal: &TemporalReport,
        deadline: Instant,
    ) -> Result<Option<VerifiedAnswer>> {
        let query_id = query.query_id;

        // === VALIDATE ===
        ledger.enter(PipelineStage::Validating).await?;

        let review = self.reviewer.review(&mut fact, program, temporal, query.as_of);
        ledger.fact = Some(FactSummary::from(&fact));
        ledger.review = Some(review.clone());
        ledger.lineage.append(LineageEvent::Reviewed {
            fact_id: fact.fact_id(),
            review: review.clone(),
        })
        .await;

        if review.verdict == ReviewVerdict::Reject {
            let reasons: Vec<&str> = review.concerns.iter().map(|c| c.message.as_str()).collect();
            ledger.state.fail(
                FailureKind::ReviewRejected,
                &format!("reviewer rejected the result: {}", reasons.join("; ")),
            );
            return Ok(None);
        }

        // === DEBATE ===
        ledger.enter(PipelineStage::Debating).await?;

        let request = PerspectiveRequest::new(&query.text, &fact, &review);
        let outcome = match timeout_at(deadline, self.debate.debate(&mut fact, request)).await {
            Err(_) => {
                self.deadline_exceeded(&mut ledger.state, "debating");
                return Ok(None);
            }
            Ok(outcome) => outcome,
        };

        ledger.total_cost += outcome.usage.cost_usd;
        if outcome.is_degraded() {
            warn!(
                query_id = %query_id,
                completed = outcome.synthesis.perspectives_completed,
                requested = outcome.synthesis.perspectives_requested,
                "Debate degraded"
            );
            ledger.degradations.push(FailureKind::DebatePartialFailure);
        }
        ledger.fact = Some(FactSummary::from(&fact));
        let record = outcome.record();
        ledger.debate = Some(record.clone());
        ledger.lineage.append(LineageEvent::Debated {
            fact_id: fact.fact_id(),
            debate: record,
        })
        .await;

        ledger.state.complete()?;
        ledger.lineage.append(LineageEvent::StageEntered {
            stage: PipelineStage::Completed,
        })
        .await;

        let summary = format!(
            "{} (confidence {:.2}, source: {}, data as of {}). {}",
            fact.statement(),
            fact.confidence(),
            fact.source(),
            fact.freshness().format("%Y-%m-%d"),
            self.config.disclaimer
        );

        Ok(Some(VerifiedAnswer {
            fact,
            summary,
            review_verdict: review.verdict,
            synthesis: outcome.synthesis,
        }))
    }

    async fn finish(
        &self,
        query: &AnalysisQuery,
        ledger: RunLedger,
        answer: Option<VerifiedAnswer>,
    ) -> PipelineOutcome {
        let RunLedger {
            state,
            mut lineage,
            total_cost,
            fact,
            review,
            debate,
            degradations,
        } = ledger;

        if let Some(failure) = state.failure() {
            lineage
                .append(LineageEvent::Failed {
                    failure: failure.clone(),
                })
                .await;
        }
        if lineage.dropped > 0 {
            warn!(
                query_id = %query.query_id,
                dropped = lineage.dropped,
                "Lineage entries lost for this run"
            );
        }

        let audit = AuditRecord {
            audit_id: Uuid::new_v4(),
            query_id: query.query_id,
            stages_visited: state.history().to_vec(),
            fact,
            temporal_violations: state.temporal_violations().to_vec(),
            review,
            debate,
            total_cost,
            disclaimer_text: self.config.disclaimer.clone(),
            final_stage: state.stage(),
            failure: state.failure().cloned(),
            degradations,
            retry_count: state.retry_count(),
            created_at: Utc::now(),
            execution_time_ms: state.elapsed_ms(),
        };

        if let Err(e) = self.audit_log.record(audit.clone()).await {
            warn!(query_id = %query.query_id, error = %e, "Audit record not stored");
        }

        match state.failure() {
            None => info!(
                query_id = %query.query_id,
                retries = state.retry_count(),
                cost_usd = total_cost,
                elapsed_ms = audit.execution_time_ms,
                "Pipeline completed"
            ),
            Some(failure) => warn!(
                query_id = %query.query_id,
                stage = %failure.stage,
                kind = %failure.kind,
                reason = %failure.reason,
                retries = state.retry_count(),
                "Pipeline failed"
            ),
        }

        PipelineOutcome {
            state,
            answer,
            audit,
        }
    }

    fn deadline_exceeded(&self, state: &mut PipelineState, during: &str) -> Attempt {
        state.fail(
            FailureKind::DeadlineExceeded,
            &format!(
                "pipeline deadline of {:?} exceeded while {}",
                self.config.deadline, during
            ),
        );
        Attempt::Stopped
    }

}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    let s = s.trim_end();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
