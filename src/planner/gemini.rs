//! Gemini-powered plan generator
//!
//! Asks the model for analysis code and the datasets it needs, as JSON.

use crate::error::OrchestrationError;
use crate::gemini::{extract_json_block, GeminiClient};
use crate::models::{
    AnalysisPlan, AnalysisQuery, CodeBlock, DataKind, DataRequirement, DateRange, PlanFeedback,
};
use crate::planner::{GeneratedPlan, PlanGenerator};
use crate::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

const MAX_CODE_BLOCKS: usize = 8;

const SYSTEM_PROMPT: &str = r#"You write small, deterministic Python analysis programs for financial questions.
You never state numbers yourself; the program computes them."#;

pub struct GeminiPlanner {
    client: GeminiClient,
}

impl GeminiPlanner {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    /// Build structured planning prompt
    fn build_prompt(&self, query: &AnalysisQuery, feedback: Option<&PlanFeedback>) -> String {
        let as_of = query
            .as_of
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());

        let base_prompt = format!(
            r#"QUESTION:
{}

AS-OF DATE:
{}

Program contract:
- Datasets you request are available as JSON files at $SANDBOX_DATA_DIR/<id>.json
- Only the Python standard library, pandas and numpy are available
- No network access, no subprocesses, no eval/exec, no dynamic imports
- Never use data after the as-of date: no negative shifts, no centered
  rolling windows, filter by date before taking the last row
- Print exactly ONE JSON object on the last line of stdout, mapping
  metric names to numbers (e.g. {{"correlation": 0.42, "n": 250}})

Rules:
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{
  "code_blocks": [
    {{ "order": 1, "source": "<python>", "description": "..." }}
  ],
  "data_requirements": [
    {{ "id": "aapl_prices", "kind": "prices", "source": "AAPL", "start": "2023-01-01", "end": "2023-12-31" }}
  ],
  "confidence": 0.0
}}
"#,
            query.text, as_of,
        );

        if let Some(fb) = feedback {
            format!(
                "{}\n\nGenerate a DIFFERENT program that avoids these problems.\n\n{}",
                fb.render(),
                base_prompt
            )
        } else {
            base_prompt
        }
    }
}

#[async_trait]
impl PlanGenerator for GeminiPlanner {
    async fn generate_plan(
        &self,
        query: &AnalysisQuery,
        feedback: Option<&PlanFeedback>,
    ) -> Result<GeneratedPlan> {
        let prompt = self.build_prompt(query, feedback);
        let reply = self.client.generate(SYSTEM_PROMPT, &prompt).await?;

        debug!(
            query_id = %query.query_id,
            tokens = reply.usage.total_tokens(),
            "Plan response received"
        );

        Ok(GeneratedPlan {
            plan: parse_plan_response(&reply.text, query)?,
            usage: reply.usage,
        })
    }
}

/// Parse plan response from Gemini
pub(crate) fn parse_plan_response(response: &str, query: &AnalysisQuery) -> Result<AnalysisPlan> {
    let json = extract_json_block(response).ok_or_else(|| {
        OrchestrationError::InvalidPlan(format!(
            "plan response is not a JSON object | raw={}",
            response
        ))
    })?;

    let blocks_json = json
        .get("code_blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| OrchestrationError::InvalidPlan("Missing code_blocks array".to_string()))?;

    if blocks_json.is_empty() {
        return Err(OrchestrationError::InvalidPlan(
            "Plan has no code blocks".to_string(),
        ));
    }
    if blocks_json.len() > MAX_CODE_BLOCKS {
        return Err(OrchestrationError::InvalidPlan(format!(
            "Plan exceeds maximum allowed code blocks ({})",
            MAX_CODE_BLOCKS
        )));
    }

    let mut code_blocks = Vec::with_capacity(blocks_json.len());
    for (idx, block) in blocks_json.iter().enumerate() {
        let source = block
            .get("source")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                OrchestrationError::InvalidPlan(format!("Code block {} has no source", idx + 1))
            })?
            .to_string();

        code_blocks.push(CodeBlock {
            order: block
                .get("order")
                .and_then(Value::as_u64)
                .map(|o| o as u32)
                .unwrap_or(idx as u32 + 1),
            source,
            description: block
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let data_requirements = json
        .get("data_requirements")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(parse_requirement)
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    let confidence = json
        .get("confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Ok(AnalysisPlan {
        plan_id: Uuid::new_v4(),
        query_id: query.query_id,
        query_text: query.text.clone(),
        code_blocks,
        data_requirements,
        confidence,
        created_at: Utc::now(),
    })
}

fn parse_requirement(value: &Value) -> Result<DataRequirement> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| OrchestrationError::InvalidPlan("Data requirement without id".to_string()))?
        .to_string();

    let kind = value
        .get("kind")
        .cloned()
        .and_then(|k| serde_json::from_value::<DataKind>(k).ok())
        .unwrap_or(DataKind::Other);

    let date = |field: &str| -> Option<NaiveDate> {
        value
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    };

    Ok(DataRequirement {
        source: value
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string(),
        kind,
        range: DateRange {
            start: date("start"),
            end: date("end"),
        },
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> AnalysisQuery {
        AnalysisQuery::new("AAPL/MSFT correlation in 2023", NaiveDate::from_ymd_opt(2023, 12, 31))
    }

    #[test]
    fn test_parse_fenced_plan() {
        let raw = r#"```json
{
  "code_blocks": [
    {"order": 2, "source": "print(json.dumps(out))"},
    {"order": 1, "source": "import json\nout = {'n': 1}", "description": "setup"}
  ],
  "data_requirements": [
    {"id": "aapl", "kind": "prices", "source": "AAPL", "start": "2023-01-01", "end": "2023-12-31"},
    {"id": "cpi", "kind": "macro"}
  ],
  "confidence": 1.7
}
```"#;

        let plan = parse_plan_response(raw, &query()).unwrap();
        assert_eq!(
            plan.program(),
            "import json\nout = {'n': 1}\n\nprint(json.dumps(out))"
        );
        assert_eq!(plan.data_requirements.len(), 2);
        assert_eq!(plan.data_requirements[0].kind, DataKind::Prices);
        assert_eq!(
            plan.data_requirements[0].range.end,
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(plan.data_requirements[1].kind, DataKind::Other);
        assert_eq!(plan.data_requirements[1].source, "cpi");
        assert_eq!(plan.confidence, 1.0);
    }

    #[test]
    fn test_malformed_plans_rejected() {
        assert!(parse_plan_response("I think the answer is 0.42", &query()).is_err());
        assert!(parse_plan_response(r#"{"code_blocks": []}"#, &query()).is_err());
        assert!(parse_plan_response(r#"{"code_blocks": [{"source": "  "}]}"#, &query()).is_err());
        assert!(parse_plan_response(
            r#"{"code_blocks": [{"source": "print(1)"}], "data_requirements": [{"kind": "prices"}]}"#,
            &query()
        )
        .is_err());
    }
}
