//! Pipeline configuration
//!
//! One explicit object, built once and injected into every adapter at
//! construction. Nothing reads the environment after startup.

use crate::data::DataApiConfig;
use crate::debate::DebateConfig;
use crate::error::OrchestrationError;
use crate::execution::{IsolationMode, SandboxPolicy};
use crate::gemini::GeminiConfig;
use crate::models::PerspectiveRole;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_DEADLINE_SECS: u64 = 120;
pub const DEFAULT_SANDBOX_SLOTS: usize = 4;
pub const DEFAULT_LINEAGE_WRITE_TIMEOUT_MS: u64 = 500;

const DEFAULT_DISCLAIMER: &str =
    "Figures are computed from executed code over the cited data sources. Not investment advice.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Regeneration attempts after the first plan (retry ceiling).
    pub max_retries: u32,
    /// Wall-clock budget for one whole query.
    pub deadline: Duration,
    pub disclaimer: String,
    pub sandbox: SandboxPolicy,
    pub sandbox_slots: usize,
    pub debate: DebateConfig,
    pub gemini: Option<GeminiConfig>,
    /// Data APIs in priority order (primary first).
    pub data_apis: Vec<DataApiConfig>,
    /// Bound on a single lineage write; the store is best-effort.
    pub lineage_write_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            sandbox: SandboxPolicy::default(),
            sandbox_slots: DEFAULT_SANDBOX_SLOTS,
            debate: DebateConfig::default(),
            gemini: None,
            data_apis: Vec::new(),
            lineage_write_timeout: Duration::from_millis(DEFAULT_LINEAGE_WRITE_TIMEOUT_MS),
        }
    }
}

impl PipelineConfig {
    /// Build configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let sandbox_defaults = SandboxPolicy::default();
        let debate_defaults = DebateConfig::default();

        let isolation = match env::var("SANDBOX_ISOLATION") {
            Ok(value) => parse_isolation(&value)?,
            Err(_) => sandbox_defaults.isolation,
        };

        let interpreter = env::var("SANDBOX_INTERPRETER")
            .ok()
            .map(|v| {
                v.split_whitespace()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(sandbox_defaults.interpreter.clone());

        let sandbox = SandboxPolicy {
            interpreter,
            timeout_ms: env_parse("SANDBOX_TIMEOUT_MS", sandbox_defaults.timeout_ms)?,
            memory_limit_mb: env_parse("SANDBOX_MEMORY_MB", sandbox_defaults.memory_limit_mb)?,
            allowed_hosts: env_list("SANDBOX_ALLOWED_HOSTS"),
            isolation,
            max_output_bytes: env_parse(
                "SANDBOX_MAX_OUTPUT_BYTES",
                sandbox_defaults.max_output_bytes,
            )?,
            ..sandbox_defaults
        };

        let roles = {
            let raw = env_list("DEBATE_ROLES");
            if raw.is_empty() {
                debate_defaults.roles.clone()
            } else {
                raw.iter()
                    .map(|r| {
                        PerspectiveRole::parse(r).ok_or_else(|| {
                            OrchestrationError::ConfigError(format!(
                                "DEBATE_ROLES: unknown role '{}'",
                                r
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
        };

        let debate = DebateConfig {
            roles,
            per_call_timeout: Duration::from_millis(env_parse(
                "DEBATE_PER_CALL_TIMEOUT_MS",
                debate_defaults.per_call_timeout.as_millis() as u64,
            )?),
            stage_timeout: Duration::from_millis(env_parse(
                "DEBATE_STAGE_TIMEOUT_MS",
                debate_defaults.stage_timeout.as_millis() as u64,
            )?),
        };

        let gemini = match env::var("GEMINI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => {
                let mut cfg = GeminiConfig::new(key);
                if let Ok(model) = env::var("GEMINI_MODEL") {
                    cfg.model = model;
                }
                cfg.cost_per_1k_tokens =
                    env_parse("GEMINI_COST_PER_1K_TOKENS", cfg.cost_per_1k_tokens)?;
                Some(cfg)
            }
            _ => None,
        };

        let mut data_apis = Vec::new();
        if let Ok(base_url) =
            env::var("FINANCIAL_API_BASE_URL").or_else(|_| env::var("DATA_API_BASE_URL"))
        {
            data_apis.push(DataApiConfig {
                name: "primary".to_string(),
                base_url,
                api_key: env::var("FINANCIAL_API_KEY").ok(),
                timeout: Duration::from_secs(30),
            });
        }
        if let Ok(base_url) = env::var("SECONDARY_DATA_API_BASE_URL") {
            data_apis.push(DataApiConfig {
                name: "secondary".to_string(),
                base_url,
                api_key: env::var("SECONDARY_DATA_API_KEY").ok(),
                timeout: Duration::from_secs(30),
            });
        }

        Ok(Self {
            max_retries: env_parse("PIPELINE_MAX_RETRIES", defaults.max_retries)?,
            deadline: Duration::from_secs(env_parse(
                "PIPELINE_DEADLINE_SECS",
                defaults.deadline.as_secs(),
            )?),
            disclaimer: env::var("PIPELINE_DISCLAIMER").unwrap_or(defaults.disclaimer),
            sandbox,
            sandbox_slots: env_parse("SANDBOX_SLOTS", defaults.sandbox_slots)?,
            debate,
            gemini,
            data_apis,
            lineage_write_timeout: Duration::from_millis(env_parse(
                "LINEAGE_WRITE_TIMEOUT_MS",
                defaults.lineage_write_timeout.as_millis() as u64,
            )?),
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, raw))
        }),
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| parse_list(&raw))
        .unwrap_or_default()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_isolation(raw: &str) -> Result<IsolationMode> {
    match raw.trim().to_lowercase().as_str() {
        "bubblewrap" | "bwrap" => Ok(IsolationMode::Bubblewrap),
        "none" | "unjailed" | "process" => Ok(IsolationMode::Unjailed),
        other => Err(OrchestrationError::ConfigError(format!(
            "SANDBOX_ISOLATION: unknown mode '{}'",
            other
        ))),
    }
}
