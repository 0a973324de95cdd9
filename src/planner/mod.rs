//! Plan generator trait and implementations
//!
//! A plan generator turns a query (and optional negative feedback from a
//! failed attempt) into ordered code blocks plus data requirements. It is
//! the only LLM-controlled step before execution; nothing it says is a fact.

use crate::error::OrchestrationError;
use crate::models::{AnalysisPlan, AnalysisQuery, CodeBlock, DataRequirement, PlanFeedback, TokenUsage};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

pub mod gemini;
pub use gemini::GeminiPlanner;

/// A plan plus what it cost to produce
#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    pub plan: AnalysisPlan,
    pub usage: TokenUsage,
}

/// Trait for plan generation (LLM controlled)
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Create a plan for a query, optionally with feedback from the last failed attempt
    async fn generate_plan(
        &self,
        query: &AnalysisQuery,
        feedback: Option<&PlanFeedback>,
    ) -> Result<GeneratedPlan>;
}

/// One canned response of the mock planner
#[derive(Debug, Clone)]
pub enum PlanScript {
    Program {
        code: String,
        data_requirements: Vec<DataRequirement>,
    },
    Fail(String),
}

impl PlanScript {
    pub fn program(code: impl Into<String>) -> Self {
        PlanScript::Program {
            code: code.into(),
            data_requirements: Vec::new(),
        }
    }

    pub fn with_data(code: impl Into<String>, data_requirements: Vec<DataRequirement>) -> Self {
        PlanScript::Program {
            code: code.into(),
            data_requirements,
        }
    }
}

/// Mock planner for development & testing
/// Replays scripted programs in order; the last one repeats once exhausted
pub struct MockPlanner {
    scripts: Vec<PlanScript>,
    calls: AtomicUsize,
    feedback: Mutex<Vec<PlanFeedback>>,
}

impl MockPlanner {
    pub fn new(scripts: Vec<PlanScript>) -> Self {
        Self {
            scripts,
            calls: AtomicUsize::new(0),
            feedback: Mutex::new(Vec::new()),
        }
    }

    /// Offline default: a computation that needs no data
    pub fn demo() -> Self {
        Self::new(vec![PlanScript::program(
            "import json\n\
             returns = [0.012, -0.004, 0.007, 0.015, -0.009, 0.003, 0.011, -0.002]\n\
             mean = sum(returns) / len(returns)\n\
             print(json.dumps({\"metric\": \"mean_daily_return\", \"value\": round(mean, 6), \"n\": len(returns)}))",
        )])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Feedback received so far, in call order
    pub fn feedback_seen(&self) -> Vec<PlanFeedback> {
        self.feedback
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlanGenerator for MockPlanner {
    async fn generate_plan(
        &self,
        query: &AnalysisQuery,
        feedback: Option<&PlanFeedback>,
    ) -> Result<GeneratedPlan> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(fb) = feedback {
            if let Ok(mut seen) = self.feedback.lock() {
                seen.push(fb.clone());
            }
        }

        let script = self
            .scripts
            .get(call)
            .or_else(|| self.scripts.last())
            .ok_or_else(|| OrchestrationError::PlanningError("mock planner has no scripts".to_string()))?;

        match script {
            PlanScript::Fail(reason) => Err(OrchestrationError::PlanningError(reason.clone())),
            PlanScript::Program {
                code,
                data_requirements,
            } => Ok(GeneratedPlan {
                plan: AnalysisPlan {
                    plan_id: Uuid::new_v4(),
                    query_id: query.query_id,
                    query_text: query.text.clone(),
                    code_blocks: vec![CodeBlock {
                        order: 1,
                        source: code.clone(),
                        description: "scripted".to_string(),
                    }],
                    data_requirements: data_requirements.clone(),
                    confidence: 0.8,
                    created_at: Utc::now(),
                },
                usage: TokenUsage::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;

    #[tokio::test]
    async fn test_mock_planner_replays_and_records_feedback() {
        let planner = MockPlanner::new(vec![
            PlanScript::Fail("model unavailable".to_string()),
            PlanScript::program("print(1)"),
        ]);
        let query = AnalysisQuery::new("q", None);

        assert!(planner.generate_plan(&query, None).await.is_err());

        let feedback = PlanFeedback {
            failure_kind: FailureKind::PlanGenerationError,
            reasons: vec!["model unavailable".to_string()],
            rejected_fingerprint: None,
            attempt: 1,
        };
        let plan = planner.generate_plan(&query, Some(&feedback)).await.unwrap();
        assert_eq!(plan.plan.program(), "print(1)");
        assert_eq!(plan.plan.query_id, query.query_id);

        // last script repeats
        assert!(planner.generate_plan(&query, None).await.is_ok());
        assert_eq!(planner.calls(), 3);
        assert_eq!(planner.feedback_seen().len(), 1);
    }
}
