//! Gemini API client
//!
//! Used by the plan generator and the debate perspectives. One long-lived
//! reqwest::Client per process for connection pooling; credentials and
//! pricing come from an injected `GeminiConfig`.

use crate::error::OrchestrationError;
use crate::models::TokenUsage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// USD per 1,000 tokens (prompt and completion alike).
    pub cost_per_1k_tokens: f64,
    pub temperature: f32,
    pub max_output_tokens: i32,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            cost_per_1k_tokens: 0.000_375,
            temperature: 0.3,
            max_output_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

/// Text plus what it cost
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub confidence: f64,
    pub usage: TokenUsage,
}

/// Reusable Gemini client (connection-pooled)
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> crate::Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(OrchestrationError::ConfigError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// One generateContent round trip
    pub async fn generate(&self, system_prompt: &str, prompt: &str) -> crate::Result<LlmReply> {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: self.config.max_output_tokens,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        debug!(model = %self.config.model, "Calling Gemini API");

        let response = self
            .client
            .post(self.config.endpoint())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let text = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| OrchestrationError::LlmError("Empty response from Gemini".to_string()))?;

        let confidence = calculate_confidence(&gemini_response);
        let usage = usage_of(&gemini_response, self.config.cost_per_1k_tokens);

        debug!(
            confidence,
            tokens = usage.total_tokens(),
            cost_usd = usage.cost_usd,
            "Gemini response received"
        );

        Ok(LlmReply {
            text,
            confidence,
            usage,
        })
    }
}

/// Pull a JSON object out of free-form model output.
///
/// Tries a ```json fenced block first, then the widest `{ ... }` span.
pub fn extract_json_block(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(parsed) = serde_json::from_str::<Value>(after[..end].trim()) {
                if parsed.is_object() {
                    return Some(parsed);
                }
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

fn usage_of(response: &GeminiResponse, cost_per_1k_tokens: f64) -> TokenUsage {
    let (prompt_tokens, completion_tokens) = response
        .usage_metadata
        .as_ref()
        .map(|u| (u.prompt_token_count, u.candidates_token_count))
        .unwrap_or((0, 0));

    TokenUsage {
        prompt_tokens,
        completion_tokens,
        cost_usd: (prompt_tokens + completion_tokens) as f64 / 1000.0 * cost_per_1k_tokens,
    }
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f64 {
    let base_confidence: f64 = 0.85;

    let Some(candidate) = response.candidates.first() else {
        return 0.5;
    };

    let finish_confidence = match candidate.finish_reason.as_deref() {
        Some("STOP") => 1.0,
        Some("MAX_TOKENS") | Some("LENGTH") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    let response_length = candidate.content.parts.first().map(|p| p.text.len()).unwrap_or(0);

    let length_confidence = if response_length < 50 {
        0.6
    } else if response_length > 4000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence).clamp(0.5, 0.98)
}
