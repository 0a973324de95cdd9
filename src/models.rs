//! Core data models for the verified analysis pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub use crate::extraction::VerifiedFact;

//
// ================= Query =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisQuery {
    pub query_id: Uuid,
    pub text: String,
    /// Reference date for look-ahead checks. `None` skips temporal analysis.
    pub as_of: Option<NaiveDate>,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisQuery {
    pub fn new(text: impl Into<String>, as_of: Option<NaiveDate>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            text: text.into(),
            as_of,
            submitted_at: Utc::now(),
        }
    }
}

//
// ================= Plan =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Prices,
    Returns,
    Fundamentals,
    Economic,
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRequirement {
    /// Identifier the code uses to locate the dataset (`<id>.json`).
    pub id: String,
    pub kind: DataKind,
    /// Upstream series or symbol, e.g. `AAPL` or `FRED:CPIAUCSL`.
    pub source: String,
    #[serde(default)]
    pub range: DateRange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeBlock {
    pub order: u32,
    pub source: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub plan_id: Uuid,
    pub query_id: Uuid,
    pub query_text: String,
    pub code_blocks: Vec<CodeBlock>,
    pub data_requirements: Vec<DataRequirement>,
    /// Self-reported by the plan generator, clamped to [0, 1].
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl AnalysisPlan {
    /// The single code unit handed to the sandbox: blocks in order, separated by a blank line.
    pub fn program(&self) -> String {
        let mut blocks: Vec<&CodeBlock> = self.code_blocks.iter().collect();
        blocks.sort_by_key(|b| b.order);

        blocks
            .iter()
            .map(|b| b.source.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn needs_data(&self) -> bool {
        !self.data_requirements.is_empty()
    }
}

/// Which provider actually served a requirement, and when
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataProvenance {
    pub requirement_id: String,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

/// Negative feedback handed back to the plan generator on regeneration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFeedback {
    pub failure_kind: FailureKind,
    pub reasons: Vec<String>,
    pub rejected_fingerprint: Option<String>,
    pub attempt: u32,
}

impl PlanFeedback {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Previous attempt {} failed ({}).",
            self.attempt, self.failure_kind
        );
        for reason in &self.reasons {
            out.push_str("\n- ");
            out.push_str(reason);
        }
        if self.rejected_fingerprint.is_some() {
            out.push_str("\nDo NOT resubmit the same code.");
        }
        out
    }
}

//
// ================= Execution =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTelemetry {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub memory_used_kb: Option<u64>,
    /// SHA-256 (hex) of the exact code unit this telemetry belongs to.
    pub code_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Why the code never ran (only for `Blocked`).
    #[serde(default)]
    pub block_reasons: Vec<String>,
}

impl ExecutionTelemetry {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Scalar pulled out of sandbox stdout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExtractedValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ExtractedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ExtractedValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ExtractedValue::Number(_))
    }
}

impl fmt::Display for ExtractedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractedValue::Number(n) => write!(f, "{}", n),
            ExtractedValue::Bool(b) => write!(f, "{}", b),
            ExtractedValue::Text(s) => write!(f, "{}", s),
        }
    }
}

pub type ExtractedValues = BTreeMap<String, ExtractedValue>;

//
// ================= Temporal =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    LookAheadShift,
    FutureDateAccess,
    TrailingIndexWithoutFilter,
    CenteredRollingWindow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporalViolation {
    pub kind: ViolationKind,
    pub severity: Severity,
    /// 1-based line in the analysed program.
    pub line: usize,
    pub description: String,
}

impl TemporalViolation {
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

//
// ================= Review =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Accept,
    Challenge,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConcern {
    pub check: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub verdict: ReviewVerdict,
    pub concerns: Vec<ReviewConcern>,
    /// Absolute confidence removed from the fact by this review.
    pub confidence_penalty: f64,
    pub confidence_before: f64,
    pub confidence_after: f64,
    pub suggestions: Vec<String>,
    pub reviewed_at: DateTime<Utc>,
}

//
// ================= Debate =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveRole {
    Supportive,
    Skeptical,
    Neutral,
    RiskSpecialist,
}

impl PerspectiveRole {
    pub fn all() -> Vec<PerspectiveRole> {
        vec![
            PerspectiveRole::Supportive,
            PerspectiveRole::Skeptical,
            PerspectiveRole::Neutral,
        ]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "supportive" | "bull" => Some(PerspectiveRole::Supportive),
            "skeptical" | "sceptical" | "bear" => Some(PerspectiveRole::Skeptical),
            "neutral" => Some(PerspectiveRole::Neutral),
            "risk_specialist" | "risk" => Some(PerspectiveRole::RiskSpecialist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Bullish,
    Bearish,
    Neutral,
}

impl Stance {
    pub fn sign(&self) -> f64 {
        match self {
            Stance::Bullish => 1.0,
            Stance::Bearish => -1.0,
            Stance::Neutral => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebatePerspective {
    pub role: PerspectiveRole,
    pub stance: Stance,
    pub narrative: String,
    pub supporting_points: Vec<String>,
    /// Self-reported, clamped to [0, 1]. Not used as the debate score.
    pub confidence: f64,
    #[serde(default)]
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisVerdict {
    Supported,
    Contested,
    Refuted,
    NoDebate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebateFlag {
    PartialDebate,
    NoDebatePerformed,
    StageTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub verdict: SynthesisVerdict,
    pub pre_debate_confidence: f64,
    pub debate_quality: f64,
    pub adjusted_confidence: f64,
    pub risks: Vec<String>,
    pub opportunities: Vec<String>,
    pub flags: Vec<DebateFlag>,
    pub perspectives_requested: usize,
    pub perspectives_completed: usize,
}

impl Synthesis {
    pub fn is_degraded(&self) -> bool {
        !self.flags.is_empty()
    }
}

//
// ================= Pipeline =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Initialized,
    Planning,
    Fetching,
    Executing,
    Validating,
    Debating,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Initialized => "initialized",
            PipelineStage::Planning => "planning",
            PipelineStage::Fetching => "fetching",
            PipelineStage::Executing => "executing",
            PipelineStage::Validating => "validating",
            PipelineStage::Debating => "debating",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PlanGenerationError,
    FetchError,
    SafetyBlocked,
    TemporalBlocked,
    ExecutionError,
    ExecutionTimeout,
    ExtractionRejected,
    ReviewRejected,
    /// Non-fatal: some or all debate perspectives were missing.
    DebatePartialFailure,
    DeadlineExceeded,
    RetryLimitExceeded,
    RepeatedBlockedCode,
}

impl FailureKind {
    /// Whether the orchestrator may go back to planning after this outcome.
    ///
    /// Blocked kinds are retryable only through regeneration; the identical
    /// code is never run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::PlanGenerationError
                | FailureKind::FetchError
                | FailureKind::SafetyBlocked
                | FailureKind::TemporalBlocked
                | FailureKind::ExecutionError
                | FailureKind::ExecutionTimeout
                | FailureKind::ExtractionRejected
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::PlanGenerationError => "plan_generation_error",
            FailureKind::FetchError => "fetch_error",
            FailureKind::SafetyBlocked => "safety_blocked",
            FailureKind::TemporalBlocked => "temporal_blocked",
            FailureKind::ExecutionError => "execution_error",
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::ExtractionRejected => "extraction_rejected",
            FailureKind::ReviewRejected => "review_rejected",
            FailureKind::DebatePartialFailure => "debate_partial_failure",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::RetryLimitExceeded => "retry_limit_exceeded",
            FailureKind::RepeatedBlockedCode => "repeated_blocked_code",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFailure {
    /// Last non-terminal stage reached before failing.
    pub stage: PipelineStage,
    pub kind: FailureKind,
    pub reason: String,
}

//
// ================= Audit =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSummary {
    pub fact_id: Uuid,
    pub fingerprint: String,
    pub extracted_values: ExtractedValues,
    pub confidence: f64,
    pub source: String,
    pub freshness: DateTime<Utc>,
}

impl From<&VerifiedFact> for FactSummary {
    fn from(fact: &VerifiedFact) -> Self {
        Self {
            fact_id: fact.fact_id(),
            fingerprint: fact.code_fingerprint().to_string(),
            extracted_values: fact.extracted_values().clone(),
            confidence: fact.confidence(),
            source: fact.source().to_string(),
            freshness: fact.freshness(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveCallStatus {
    Completed,
    /// Provider answered with an error or an unusable reply.
    Failed,
    TimedOut,
    /// Still outstanding when the debate stage ran out of time.
    Abandoned,
}

/// One provider call, recorded whether or not it produced a perspective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveCall {
    pub role: PerspectiveRole,
    pub status: PerspectiveCallStatus,
    /// Tokens the provider reported. Zero when the call never returned.
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRecord {
    pub perspectives: Vec<DebatePerspective>,
    #[serde(default)]
    pub calls: Vec<PerspectiveCall>,
    /// Sum over all calls, including failed ones.
    #[serde(default)]
    pub usage: TokenUsage,
    pub synthesis: Synthesis,
}

/// External audit trail for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: Uuid,
    pub query_id: Uuid,
    pub stages_visited: Vec<PipelineStage>,
    pub fact: Option<FactSummary>,
    pub temporal_violations: Vec<TemporalViolation>,
    pub review: Option<ReviewResult>,
    pub debate: Option<DebateRecord>,
    pub total_cost: f64,
    pub disclaimer_text: String,
    pub final_stage: PipelineStage,
    pub failure: Option<PipelineFailure>,
    /// Non-fatal failures that lowered quality without stopping the run.
    #[serde(default)]
    pub degradations: Vec<FailureKind>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

//
// ================= Final Result =================
//

/// The only shape a numeric answer leaves the pipeline in.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedAnswer {
    pub fact: VerifiedFact,
    pub summary: String,
    pub review_verdict: ReviewVerdict,
    pub synthesis: Synthesis,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for PerspectiveRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PerspectiveRole::Supportive => "supportive",
            PerspectiveRole::Skeptical => "skeptical",
            PerspectiveRole::Neutral => "neutral",
            PerspectiveRole::RiskSpecialist => "risk_specialist",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(blocks: Vec<CodeBlock>) -> AnalysisPlan {
        AnalysisPlan {
            plan_id: Uuid::new_v4(),
            query_id: Uuid::new_v4(),
            query_text: "q".to_string(),
            code_blocks: blocks,
            data_requirements: vec![],
            confidence: 0.9,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_program_orders_blocks() {
        let plan = plan_with(vec![
            CodeBlock {
                order: 2,
                source: "print(x)\n".to_string(),
                description: String::new(),
            },
            CodeBlock {
                order: 1,
                source: "x = 1".to_string(),
                description: String::new(),
            },
        ]);

        assert_eq!(plan.program(), "x = 1\n\nprint(x)");
        assert!(!plan.needs_data());
    }

    #[test]
    fn test_failure_kind_retryable() {
        assert!(FailureKind::ExecutionTimeout.is_retryable());
        assert!(FailureKind::TemporalBlocked.is_retryable());
        assert!(!FailureKind::ReviewRejected.is_retryable());
        assert!(!FailureKind::RepeatedBlockedCode.is_retryable());
        assert_eq!(
            serde_json::to_string(&FailureKind::SafetyBlocked).unwrap(),
            "\"safety_blocked\""
        );
    }

    #[test]
    fn test_violation_kind_wire_format() {
        let json = serde_json::to_string(&ViolationKind::LookAheadShift).unwrap();
        assert_eq!(json, "\"LOOK_AHEAD_SHIFT\"");
    }

    #[test]
    fn test_feedback_render_mentions_reasons() {
        let feedback = PlanFeedback {
            failure_kind: FailureKind::TemporalBlocked,
            reasons: vec!["line 3: negative shift".to_string()],
            rejected_fingerprint: Some("abc".to_string()),
            attempt: 1,
        };
        let text = feedback.render();
        assert!(text.contains("temporal_blocked"));
        assert!(text.contains("negative shift"));
        assert!(text.contains("Do NOT resubmit"));
    }
}
