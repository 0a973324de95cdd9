//! Debate and synthesis
//!
//! Independent perspectives on a reviewed fact are requested concurrently,
//! each under its own timeout, and combined into a synthesis. Missing
//! perspectives lower debate quality; they never fail the pipeline.

mod providers;

pub use providers::{GeminiPerspectiveProvider, HeuristicPerspectiveProvider};

use crate::error::OrchestrationError;
use crate::models::{
    DebateFlag, DebatePerspective, DebateRecord, ExtractedValues, PerspectiveCall,
    PerspectiveCallStatus, PerspectiveRole, ReviewResult, ReviewVerdict, Stance, Synthesis,
    SynthesisVerdict, TokenUsage, VerifiedFact,
};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

const DIVERSITY_WEIGHT: f64 = 0.35;
const EVIDENCE_WEIGHT: f64 = 0.35;
const CONSISTENCY_WEIGHT: f64 = 0.30;
/// Supporting points per perspective that count as full evidence.
const FULL_EVIDENCE_POINTS: f64 = 3.0;
const STANCE_COUNT: f64 = 3.0;
/// Net stance balance beyond which the debate is one-sided.
const VERDICT_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct DebateConfig {
    pub roles: Vec<PerspectiveRole>,
    pub per_call_timeout: Duration,
    pub stage_timeout: Duration,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            roles: PerspectiveRole::all(),
            per_call_timeout: Duration::from_secs(20),
            stage_timeout: Duration::from_secs(45),
        }
    }
}

/// What a perspective gets to see. Owned so it can move into a task.
#[derive(Debug, Clone)]
pub struct PerspectiveRequest {
    pub role: PerspectiveRole,
    pub query_text: String,
    pub statement: String,
    pub values: ExtractedValues,
    pub confidence: f64,
    pub source: String,
    pub freshness: DateTime<Utc>,
    pub review_verdict: ReviewVerdict,
    pub concerns: Vec<String>,
}

impl PerspectiveRequest {
    pub fn new(query_text: &str, fact: &VerifiedFact, review: &ReviewResult) -> Self {
        Self {
            role: PerspectiveRole::Neutral,
            query_text: query_text.to_string(),
            statement: fact.statement().to_string(),
            values: fact.extracted_values().clone(),
            confidence: fact.confidence(),
            source: fact.source().to_string(),
            freshness: fact.freshness(),
            review_verdict: review.verdict,
            concerns: review
                .concerns
                .iter()
                .map(|c| format!("[{}] {}", c.severity, c.message))
                .collect(),
        }
    }

    fn for_role(&self, role: PerspectiveRole) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }
}

/// What one provider call produced, and what it cost even when the answer
/// was unusable.
#[derive(Debug)]
pub struct PerspectiveReply {
    pub usage: TokenUsage,
    pub result: Result<DebatePerspective>,
}

impl PerspectiveReply {
    pub fn answered(perspective: DebatePerspective) -> Self {
        Self {
            usage: perspective.usage,
            result: Ok(perspective),
        }
    }

    /// The call failed before anything was billed.
    pub fn failed(error: OrchestrationError) -> Self {
        Self::unusable(TokenUsage::default(), error)
    }

    /// Tokens were spent but the reply could not be used.
    pub fn unusable(usage: TokenUsage, error: OrchestrationError) -> Self {
        Self {
            usage,
            result: Err(error),
        }
    }
}

/// One source of perspectives
#[async_trait::async_trait]
pub trait PerspectiveProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn perspective(&self, request: &PerspectiveRequest) -> PerspectiveReply;
}

#[derive(Debug, Clone)]
pub struct DebateOutcome {
    pub perspectives: Vec<DebatePerspective>,
    /// One entry per requested role, in role order.
    pub calls: Vec<PerspectiveCall>,
    pub synthesis: Synthesis,
    /// Sum over every call, usable or not.
    pub usage: TokenUsage,
}

impl DebateOutcome {
    pub fn record(&self) -> DebateRecord {
        DebateRecord {
            perspectives: self.perspectives.clone(),
            calls: self.calls.clone(),
            usage: self.usage,
            synthesis: self.synthesis.clone(),
        }
    }

    /// Some or all requested perspectives are missing.
    pub fn is_degraded(&self) -> bool {
        self.synthesis.perspectives_completed < self.synthesis.perspectives_requested
    }
}

pub struct DebateEngine {
    provider: Arc<dyn PerspectiveProvider>,
    config: DebateConfig,
}

impl DebateEngine {
    pub fn new(provider: Arc<dyn PerspectiveProvider>, config: DebateConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    /// Run the debate and move the fact's confidence to the synthesis value.
    ///
    /// Always returns a synthesis; degraded runs carry flags.
    pub async fn debate(&self, fact: &mut VerifiedFact, request: PerspectiveRequest) -> DebateOutcome {
        let requested = self.config.roles.len();
        let stage_deadline = Instant::now() + self.config.stage_timeout;

        let mut tasks = JoinSet::new();
        for role in &self.config.roles {
            let role = *role;
            let provider = Arc::clone(&self.provider);
            let req = request.for_role(role);
            let per_call = self.config.per_call_timeout;

            tasks.spawn(async move {
                // `None` means the per-call timeout fired.
                let reply = timeout(per_call, provider.perspective(&req)).await.ok();
                (role, reply)
            });
        }

        let mut completed: Vec<DebatePerspective> = Vec::with_capacity(requested);
        let mut calls: Vec<PerspectiveCall> = Vec::with_capacity(requested);
        let mut stage_timed_out = false;

        loop {
            match timeout_at(stage_deadline, tasks.join_next()).await {
                Ok(Some(Ok((role, Some(reply))))) => match reply.result {
                    Ok(perspective) => {
                        calls.push(PerspectiveCall {
                            role,
                            status: PerspectiveCallStatus::Completed,
                            usage: reply.usage,
                            error: None,
                        });
                        completed.push(perspective);
                    }
                    Err(e) => {
                        warn!(role = %role, error = %e, tokens = reply.usage.total_tokens(), "Perspective failed");
                        calls.push(PerspectiveCall {
                            role,
                            status: PerspectiveCallStatus::Failed,
                            usage: reply.usage,
                            error: Some(e.to_string()),
                        });
                    }
                },
                Ok(Some(Ok((role, None)))) => {
                    warn!(role = %role, timeout = ?self.config.per_call_timeout, "Perspective timed out");
                    calls.push(PerspectiveCall {
                        role,
                        status: PerspectiveCallStatus::TimedOut,
                        usage: TokenUsage::default(),
                        error: Some(format!(
                            "timed out after {:?}",
                            self.config.per_call_timeout
                        )),
                    });
                }
                Ok(Some(Err(join_error))) => {
                    warn!(error = %join_error, "Perspective task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        outstanding = tasks.len(),
                        "Debate stage timeout, abandoning outstanding perspectives"
                    );
                    stage_timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        // Roles that never reported back (stage timeout, panicked task).
        for role in &self.config.roles {
            if !calls.iter().any(|c| c.role == *role) {
                calls.push(PerspectiveCall {
                    role: *role,
                    status: PerspectiveCallStatus::Abandoned,
                    usage: TokenUsage::default(),
                    error: Some("no reply before the debate stage ended".to_string()),
                });
            }
        }

        let order = |role: &PerspectiveRole| {
            self.config
                .roles
                .iter()
                .position(|r| r == role)
                .unwrap_or(usize::MAX)
        };
        completed.sort_by_key(|p| order(&p.role));
        calls.sort_by_key(|c| order(&c.role));

        let mut usage = TokenUsage::default();
        for call in &calls {
            usage.add(&call.usage);
        }

        let synthesis = synthesize(fact.confidence(), &completed, requested, stage_timed_out);
        fact.set_confidence(synthesis.adjusted_confidence);
        fact.add_note(format!(
            "debate: {:?} from {}/{} perspectives, quality {:.3}",
            synthesis.verdict, synthesis.perspectives_completed, requested, synthesis.debate_quality
        ));

        info!(
            verdict = ?synthesis.verdict,
            completed = synthesis.perspectives_completed,
            requested,
            quality = synthesis.debate_quality,
            adjusted_confidence = synthesis.adjusted_confidence,
            flags = ?synthesis.flags,
            "Debate synthesized"
        );

        DebateOutcome {
            perspectives: completed,
            calls,
            synthesis,
            usage,
        }
    }
}

/// Debate quality in [0, 1]. Never derived from self-reported confidence
/// alone; that only feeds the consistency term.
pub fn debate_quality(perspectives: &[DebatePerspective], requested: usize) -> f64 {
    if perspectives.is_empty() || requested == 0 {
        return 0.0;
    }

    let n = perspectives.len() as f64;
    let coverage = (n / requested as f64).min(1.0);

    let distinct: HashSet<Stance> = perspectives.iter().map(|p| p.stance).collect();
    let diversity = distinct.len() as f64 / STANCE_COUNT;

    let mean_points = perspectives
        .iter()
        .map(|p| p.supporting_points.len() as f64)
        .sum::<f64>()
        / n;
    let evidence = (mean_points / FULL_EVIDENCE_POINTS).min(1.0);

    let (lo, hi) = perspectives.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
        let c = p.confidence.clamp(0.0, 1.0);
        (lo.min(c), hi.max(c))
    });
    let consistency = 1.0 - (hi - lo);

    (coverage
        * (DIVERSITY_WEIGHT * diversity + EVIDENCE_WEIGHT * evidence + CONSISTENCY_WEIGHT * consistency))
        .clamp(0.0, 1.0)
}

fn synthesize(
    pre_debate_confidence: f64,
    perspectives: &[DebatePerspective],
    requested: usize,
    stage_timed_out: bool,
) -> Synthesis {
    let completed = perspectives.len();
    let mut flags = Vec::new();
    if stage_timed_out {
        flags.push(DebateFlag::StageTimeout);
    }

    if completed == 0 {
        flags.push(DebateFlag::NoDebatePerformed);
        return Synthesis {
            verdict: SynthesisVerdict::NoDebate,
            pre_debate_confidence,
            debate_quality: 0.0,
            adjusted_confidence: pre_debate_confidence,
            risks: Vec::new(),
            opportunities: Vec::new(),
            flags,
            perspectives_requested: requested,
            perspectives_completed: 0,
        };
    }

    if completed < requested {
        flags.push(DebateFlag::PartialDebate);
    }

    let quality = debate_quality(perspectives, requested);
    let adjusted = ((pre_debate_confidence + quality) / 2.0).clamp(0.0, 1.0);

    // Stances weighted by how much evidence each one cites.
    let (balance, weight) = perspectives.iter().fold((0.0, 0.0), |(b, w), p| {
        let evidence = p.supporting_points.len().max(1) as f64;
        (b + p.stance.sign() * evidence, w + evidence)
    });
    let net = if weight > 0.0 { balance / weight } else { 0.0 };
    let verdict = if net > VERDICT_THRESHOLD {
        SynthesisVerdict::Supported
    } else if net < -VERDICT_THRESHOLD {
        SynthesisVerdict::Refuted
    } else {
        SynthesisVerdict::Contested
    };

    let mut risks = Vec::new();
    let mut opportunities = Vec::new();
    for p in perspectives {
        let bucket = match (p.role, p.stance) {
            (PerspectiveRole::RiskSpecialist, _) | (_, Stance::Bearish) => &mut risks,
            (_, Stance::Bullish) => &mut opportunities,
            _ => continue,
        };
        for point in &p.supporting_points {
            if !bucket.contains(point) {
                bucket.push(point.clone());
            }
        }
    }

    Synthesis {
        verdict,
        pre_debate_confidence,
        debate_quality: quality,
        adjusted_confidence: adjusted,
        risks,
        opportunities,
        flags,
        perspectives_requested: requested,
        perspectives_completed: completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::compute_fingerprint;
    use crate::extraction::{ExtractionContext, ExtractionOutcome, FactExtractionGate};
    use crate::models::{ExecutionStatus, ExecutionTelemetry};
    use uuid::Uuid;

    fn fact() -> VerifiedFact {
        let code = "print(x)";
        let telemetry = ExecutionTelemetry {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Success,
            exit_code: 0,
            stdout: r#"{"metric":"x","value":1.34}"#.to_string(),
            stderr: String::new(),
            duration_ms: 1,
            memory_used_kb: None,
            code_fingerprint: compute_fingerprint(code),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            block_reasons: vec![],
        };
        let ctx = ExtractionContext {
            query_id: Uuid::new_v4(),
            code,
            provenance: &[],
        };
        match FactExtractionGate::new().extract(&telemetry, &ctx) {
            ExtractionOutcome::Extracted { fact, .. } => fact,
            other => panic!("fixture did not extract: {:?}", other),
        }
    }

    fn review() -> ReviewResult {
        ReviewResult {
            verdict: ReviewVerdict::Accept,
            concerns: vec![],
            confidence_penalty: 0.0,
            confidence_before: 1.0,
            confidence_after: 1.0,
            suggestions: vec![],
            reviewed_at: Utc::now(),
        }
    }

    fn perspective(role: PerspectiveRole, stance: Stance, points: usize, confidence: f64) -> DebatePerspective {
        DebatePerspective {
            role,
            stance,
            narrative: format!("{} view", role),
            supporting_points: (0..points).map(|i| format!("{} point {}", role, i)).collect(),
            confidence,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                cost_usd: 0.01,
            },
        }
    }

    /// Answers per role: slow roles outlive any timeout, failing roles error
    /// before billing, garbled roles bill tokens for an unusable reply.
    #[derive(Default)]
    struct ScriptedProvider {
        slow_roles: Vec<PerspectiveRole>,
        failing_roles: Vec<PerspectiveRole>,
        garbled_roles: Vec<PerspectiveRole>,
    }

    #[async_trait::async_trait]
    impl PerspectiveProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn perspective(&self, request: &PerspectiveRequest) -> PerspectiveReply {
            if self.slow_roles.contains(&request.role) {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            if self.failing_roles.contains(&request.role) {
                return PerspectiveReply::failed(OrchestrationError::LlmError(
                    "provider down".to_string(),
                ));
            }
            if self.garbled_roles.contains(&request.role) {
                return PerspectiveReply::unusable(
                    TokenUsage {
                        prompt_tokens: 300,
                        completion_tokens: 20,
                        cost_usd: 0.004,
                    },
                    OrchestrationError::DebateError("perspective is not JSON".to_string()),
                );
            }
            let stance = match request.role {
                PerspectiveRole::Supportive => Stance::Bullish,
                PerspectiveRole::Skeptical => Stance::Bearish,
                _ => Stance::Neutral,
            };
            PerspectiveReply::answered(perspective(request.role, stance, 3, 0.8))
        }
    }

    fn engine(provider: ScriptedProvider, per_call_ms: u64, stage_ms: u64) -> DebateEngine {
        DebateEngine::new(
            Arc::new(provider),
            DebateConfig {
                roles: PerspectiveRole::all(),
                per_call_timeout: Duration::from_millis(per_call_ms),
                stage_timeout: Duration::from_millis(stage_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_full_debate() {
        let engine = engine(
            ScriptedProvider::default(),
            1_000,
            2_000,
        );
        let mut f = fact();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert_eq!(outcome.perspectives.len(), 3);
        assert_eq!(outcome.perspectives[0].role, PerspectiveRole::Supportive);
        assert!(outcome.synthesis.flags.is_empty());
        // 3 distinct stances, full evidence, identical confidences
        assert!((outcome.synthesis.debate_quality - 1.0).abs() < 1e-9);
        assert!((f.confidence() - 1.0).abs() < 1e-9);
        assert_eq!(outcome.synthesis.verdict, SynthesisVerdict::Contested);
        assert_eq!(outcome.usage.total_tokens(), 450);
        assert!((outcome.usage.cost_usd - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_one_timeout_is_partial_debate() {
        let engine = engine(
            ScriptedProvider {
                slow_roles: vec![PerspectiveRole::Neutral],
                ..ScriptedProvider::default()
            },
            100,
            2_000,
        );
        let mut f = fact();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert_eq!(outcome.synthesis.perspectives_completed, 2);
        assert_eq!(outcome.synthesis.perspectives_requested, 3);
        assert_eq!(outcome.synthesis.flags, vec![DebateFlag::PartialDebate]);
        assert_ne!(outcome.synthesis.verdict, SynthesisVerdict::NoDebate);
        assert!(outcome.synthesis.adjusted_confidence < 1.0);
        assert!((0.0..=1.0).contains(&f.confidence()));
    }

    #[tokio::test]
    async fn test_all_failing_keeps_confidence() {
        let engine = engine(
            ScriptedProvider {
                failing_roles: PerspectiveRole::all(),
                ..ScriptedProvider::default()
            },
            1_000,
            2_000,
        );
        let mut f = fact();
        f.set_confidence(0.6);
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert_eq!(outcome.synthesis.verdict, SynthesisVerdict::NoDebate);
        assert_eq!(outcome.synthesis.flags, vec![DebateFlag::NoDebatePerformed]);
        assert_eq!(f.confidence(), 0.6);
        assert_eq!(outcome.synthesis.adjusted_confidence, 0.6);
    }

    #[tokio::test]
    async fn test_stage_timeout_abandons_stragglers() {
        let engine = engine(
            ScriptedProvider {
                slow_roles: PerspectiveRole::all(),
                ..ScriptedProvider::default()
            },
            5_000,
            100,
        );
        let mut f = fact();
        let started = std::time::Instant::now();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(outcome.synthesis.flags.contains(&DebateFlag::StageTimeout));
        assert!(outcome.synthesis.flags.contains(&DebateFlag::NoDebatePerformed));
    }

    #[tokio::test]
    async fn test_unusable_reply_still_bills_usage() {
        let engine = engine(
            ScriptedProvider {
                garbled_roles: vec![PerspectiveRole::Skeptical],
                ..ScriptedProvider::default()
            },
            1_000,
            2_000,
        );
        let mut f = fact();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert_eq!(outcome.perspectives.len(), 2);
        assert!(outcome.is_degraded());
        // two answered at 150 tokens each, one garbled reply at 320
        assert_eq!(outcome.usage.total_tokens(), 620);
        assert!((outcome.usage.cost_usd - 0.024).abs() < 1e-9);

        let skeptical = &outcome.calls[1];
        assert_eq!(skeptical.role, PerspectiveRole::Skeptical);
        assert_eq!(skeptical.status, PerspectiveCallStatus::Failed);
        assert_eq!(skeptical.usage.total_tokens(), 320);
        assert!(skeptical.error.as_deref().unwrap_or_default().contains("not JSON"));

        let record = outcome.record();
        assert_eq!(record.calls.len(), 3);
        assert_eq!(record.usage, outcome.usage);
    }

    #[tokio::test]
    async fn test_every_role_gets_a_call_entry() {
        let engine = engine(
            ScriptedProvider {
                slow_roles: vec![PerspectiveRole::Neutral],
                failing_roles: vec![PerspectiveRole::Supportive],
                ..ScriptedProvider::default()
            },
            100,
            2_000,
        );
        let mut f = fact();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        let statuses: Vec<_> = outcome.calls.iter().map(|c| (c.role, c.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (PerspectiveRole::Supportive, PerspectiveCallStatus::Failed),
                (PerspectiveRole::Skeptical, PerspectiveCallStatus::Completed),
                (PerspectiveRole::Neutral, PerspectiveCallStatus::TimedOut),
            ]
        );
        assert_eq!(outcome.usage.total_tokens(), 150);
    }

    #[tokio::test]
    async fn test_stage_timeout_marks_calls_abandoned() {
        let engine = engine(
            ScriptedProvider {
                slow_roles: PerspectiveRole::all(),
                ..ScriptedProvider::default()
            },
            5_000,
            100,
        );
        let mut f = fact();
        let request = PerspectiveRequest::new("q", &f, &review());
        let outcome = engine.debate(&mut f, request).await;

        assert_eq!(outcome.calls.len(), 3);
        assert!(outcome
            .calls
            .iter()
            .all(|c| c.status == PerspectiveCallStatus::Abandoned));
        assert_eq!(outcome.usage, TokenUsage::default());
    }

    #[test]
    fn test_quality_ignores_self_confidence_mean() {
        let confident = vec![
            perspective(PerspectiveRole::Supportive, Stance::Bullish, 0, 1.0),
            perspective(PerspectiveRole::Neutral, Stance::Bullish, 0, 1.0),
        ];
        // one stance, no evidence, perfect agreement: 2/3 * (0.35/3 + 0.30)
        let q = debate_quality(&confident, 3);
        assert!((q - (2.0 / 3.0) * (0.35 / 3.0 + 0.30)).abs() < 1e-9);

        let split = vec![
            perspective(PerspectiveRole::Supportive, Stance::Bullish, 6, 0.9),
            perspective(PerspectiveRole::Skeptical, Stance::Bearish, 6, 0.1),
        ];
        let q = debate_quality(&split, 2);
        assert!((q - (0.35 * 2.0 / 3.0 + 0.35 + 0.30 * 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_evidence_weighted_verdicts() {
        let supported = synthesize(
            0.8,
            &[
                perspective(PerspectiveRole::Supportive, Stance::Bullish, 4, 0.8),
                perspective(PerspectiveRole::Skeptical, Stance::Bearish, 1, 0.8),
            ],
            2,
            false,
        );
        assert_eq!(supported.verdict, SynthesisVerdict::Supported);
        assert_eq!(supported.opportunities.len(), 4);
        assert_eq!(supported.risks.len(), 1);

        let refuted = synthesize(
            0.8,
            &[perspective(PerspectiveRole::Skeptical, Stance::Bearish, 2, 0.8)],
            1,
            false,
        );
        assert_eq!(refuted.verdict, SynthesisVerdict::Refuted);
    }
}
