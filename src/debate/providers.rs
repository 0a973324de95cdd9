//! Perspective providers

use super::{PerspectiveProvider, PerspectiveReply, PerspectiveRequest};
use crate::error::OrchestrationError;
use crate::gemini::{extract_json_block, GeminiClient, LlmReply};
use crate::models::{DebatePerspective, PerspectiveRole, ReviewVerdict, Stance, TokenUsage};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

const MAX_POINTS: usize = 6;

fn role_brief(role: PerspectiveRole) -> &'static str {
    match role {
        PerspectiveRole::Supportive => {
            "You argue the strongest honest case FOR relying on this result."
        }
        PerspectiveRole::Skeptical => {
            "You argue the strongest honest case AGAINST relying on this result: bias, small samples, regime dependence."
        }
        PerspectiveRole::Neutral => {
            "You weigh both sides and state what the number does and does not tell an investor."
        }
        PerspectiveRole::RiskSpecialist => {
            "You list the concrete risks of acting on this result: drawdown, liquidity, model and data risk."
        }
    }
}

/// Model-backed perspectives. Never sees raw output, only the verified fact.
pub struct GeminiPerspectiveProvider {
    client: GeminiClient,
}

impl GeminiPerspectiveProvider {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    fn build_prompt(request: &PerspectiveRequest) -> String {
        let values = request
            .values
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        let concerns = if request.concerns.is_empty() {
            "none".to_string()
        } else {
            request.concerns.join("\n")
        };

        format!(
            r#"QUESTION:
{}

VERIFIED RESULT (computed by executed code, do not change the numbers):
{}
{}

Source: {}
Data as of: {}
Reviewer verdict: {:?}
Reviewer concerns:
{}

Respond ONLY with JSON:
{{
  "stance": "bullish" | "bearish" | "neutral",
  "narrative": "<two or three sentences>",
  "supporting_points": ["..."],
  "confidence": 0.0
}}
"#,
            request.query_text,
            request.statement,
            values,
            request.source,
            request.freshness.to_rfc3339(),
            request.review_verdict,
            concerns,
        )
    }
}

#[async_trait]
impl PerspectiveProvider for GeminiPerspectiveProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn perspective(&self, request: &PerspectiveRequest) -> PerspectiveReply {
        match self
            .client
            .generate(role_brief(request.role), &Self::build_prompt(request))
            .await
        {
            Ok(reply) => reply_from_model(request.role, reply),
            Err(e) => PerspectiveReply::failed(e),
        }
    }
}

/// Billed usage survives a reply that does not parse.
pub(crate) fn reply_from_model(role: PerspectiveRole, reply: LlmReply) -> PerspectiveReply {
    debug!(role = %role, tokens = reply.usage.total_tokens(), "Perspective received");

    match parse_perspective(role, &reply.text, reply.confidence, reply.usage) {
        Ok(perspective) => PerspectiveReply::answered(perspective),
        Err(e) => {
            warn!(role = %role, tokens = reply.usage.total_tokens(), error = %e, "Unusable perspective reply");
            PerspectiveReply::unusable(reply.usage, e)
        }
    }
}

pub(crate) fn parse_perspective(
    role: PerspectiveRole,
    text: &str,
    fallback_confidence: f64,
    usage: TokenUsage,
) -> Result<DebatePerspective> {
    let json = extract_json_block(text).ok_or_else(|| {
        OrchestrationError::DebateError(format!("{} perspective is not JSON", role))
    })?;

    let stance = match json
        .get("stance")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        Some("bullish") | Some("supportive") | Some("positive") => Stance::Bullish,
        Some("bearish") | Some("skeptical") | Some("negative") => Stance::Bearish,
        Some("neutral") | Some("mixed") => Stance::Neutral,
        other => {
            return Err(OrchestrationError::DebateError(format!(
                "{} perspective has invalid stance {:?}",
                role, other
            )))
        }
    };

    let narrative = json
        .get("narrative")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    let supporting_points = json
        .get("supporting_points")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .take(MAX_POINTS)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let confidence = json
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .unwrap_or(fallback_confidence)
        .clamp(0.0, 1.0);

    Ok(DebatePerspective {
        role,
        stance,
        narrative,
        supporting_points,
        confidence,
        usage,
    })
}

/// Offline perspectives derived from the fact and its review.
///
/// Deterministic and free; used when no model is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicPerspectiveProvider;

impl HeuristicPerspectiveProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PerspectiveProvider for HeuristicPerspectiveProvider {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn perspective(&self, request: &PerspectiveRequest) -> PerspectiveReply {
        let reviewed_clean = request.review_verdict == ReviewVerdict::Accept && request.concerns.is_empty();
        let numbers = request
            .values
            .iter()
            .filter(|(_, v)| v.is_numeric())
            .map(|(k, v)| format!("{} = {} computed by executed code", k, v))
            .collect::<Vec<_>>();

        let (stance, narrative, mut points, confidence) = match request.role {
            PerspectiveRole::Supportive => {
                let mut points = numbers.clone();
                points.push(format!("data source: {}", request.source));
                (
                    if request.confidence >= 0.5 {
                        Stance::Bullish
                    } else {
                        Stance::Neutral
                    },
                    "The figure was produced by executed code on fetched data, not stated by a model.".to_string(),
                    points,
                    request.confidence,
                )
            }
            PerspectiveRole::Skeptical => {
                let mut points = request.concerns.clone();
                points.push("single in-sample estimate without out-of-sample check".to_string());
                (
                    if reviewed_clean { Stance::Neutral } else { Stance::Bearish },
                    "A single historical estimate says little about future behaviour.".to_string(),
                    points,
                    (1.0 - request.confidence).clamp(0.3, 0.9),
                )
            }
            PerspectiveRole::Neutral => (
                Stance::Neutral,
                format!("{} (confidence {:.2}).", request.statement, request.confidence),
                vec![
                    format!("data as of {}", request.freshness.format("%Y-%m-%d")),
                    format!("reviewer verdict: {:?}", request.review_verdict).to_lowercase(),
                ],
                0.6,
            ),
            PerspectiveRole::RiskSpecialist => {
                let mut points = vec!["historical statistics can shift across market regimes".to_string()];
                points.extend(request.concerns.iter().cloned());
                (
                    if reviewed_clean { Stance::Neutral } else { Stance::Bearish },
                    "Position sizing should not rest on this number alone.".to_string(),
                    points,
                    0.6,
                )
            }
        };
        points.truncate(MAX_POINTS);

        PerspectiveReply::answered(DebatePerspective {
            role: request.role,
            stance,
            narrative,
            supporting_points: points,
            confidence,
            usage: TokenUsage::default(),
        })
    }
}
