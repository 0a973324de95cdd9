//! Fact extraction gate
//!
//! The only place a `VerifiedFact` can be constructed. Facts come from
//! success-status telemetry whose fingerprint matches the code that was
//! run, and from nowhere else: the type has private fields, no public
//! constructor and no `Deserialize` impl.

use crate::audit::compute_fingerprint;
use crate::models::{
    DataProvenance, ExecutionStatus, ExecutionTelemetry, ExtractedValue, ExtractedValues,
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Reserved key: a structured record carrying it is treated as a failure report.
pub const RESERVED_ERROR_KEY: &str = "error";

/// Source label when no external data fed the computation.
pub const COMPUTED_SOURCE: &str = "computed";

lazy_static! {
    static ref KEY_VALUE_RE: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_ .\-]*?)\s*:\s*(.+?)\s*$")
            .expect("key-value pattern must compile");
}

//
// ================= Verified Fact =================
//

/// A numeric claim backed by executed code
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedFact {
    fact_id: Uuid,
    query_id: Uuid,
    execution_id: Uuid,
    code_fingerprint: String,
    extracted_values: ExtractedValues,
    statement: String,
    confidence: f64,
    source: String,
    freshness: DateTime<Utc>,
    source_verified: bool,
    created_at: DateTime<Utc>,
    notes: Vec<String>,
}

impl VerifiedFact {
    pub fn fact_id(&self) -> Uuid {
        self.fact_id
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn code_fingerprint(&self) -> &str {
        &self.code_fingerprint
    }

    pub fn extracted_values(&self) -> &ExtractedValues {
        &self.extracted_values
    }

    /// Numeric field by key, if present and numeric.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.extracted_values.get(key).and_then(ExtractedValue::as_f64)
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn freshness(&self) -> DateTime<Utc> {
        self.freshness
    }

    pub fn source_verified(&self) -> bool {
        self.source_verified
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Overwrite confidence, clamped to [0, 1]. NaN collapses to 0.
    pub(crate) fn set_confidence(&mut self, value: f64) {
        self.confidence = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        };
    }

    pub(crate) fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

//
// ================= Parsing =================
//

/// How stdout was interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// A single structured key -> scalar record.
    Parsed(ExtractedValues),
    /// Line-oriented `key: value` scan.
    KeyValueFallback(ExtractedValues),
    /// Neither path produced a numeric field.
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Structured,
    KeyValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    ExecutionFailed { status: ExecutionStatus },
    NoNumericValueFound,
    FingerprintMismatch { expected: String, actual: String },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::ExecutionFailed { status } => {
                write!(f, "execution_failed (status {:?})", status)
            }
            RejectionReason::NoNumericValueFound => write!(f, "no_numeric_value_found"),
            RejectionReason::FingerprintMismatch { .. } => write!(f, "fingerprint_mismatch"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    Extracted {
        fact: VerifiedFact,
        method: ExtractionMethod,
    },
    Rejected(RejectionReason),
}

/// What the gate needs besides the telemetry itself
#[derive(Debug, Clone)]
pub struct ExtractionContext<'a> {
    pub query_id: Uuid,
    /// Exact code unit that was handed to the sandbox.
    pub code: &'a str,
    pub provenance: &'a [DataProvenance],
}

/// Interpret sandbox stdout
pub fn parse_stdout(stdout: &str) -> ParsedOutput {
    if let Some(values) = parse_structured(stdout) {
        if has_numeric(&values) {
            return ParsedOutput::Parsed(values);
        }
    }

    let values = parse_key_values(stdout);
    if has_numeric(&values) {
        ParsedOutput::KeyValueFallback(values)
    } else {
        ParsedOutput::Rejected
    }
}

fn has_numeric(values: &ExtractedValues) -> bool {
    values.values().any(ExtractedValue::is_numeric)
}

fn parse_structured(stdout: &str) -> Option<ExtractedValues> {
    let trimmed = stdout.trim();

    // Whole stdout first, then the last line that looks like a record.
    let record = serde_json::from_str::<Value>(trimmed)
        .ok()
        .filter(Value::is_object)
        .or_else(|| {
            trimmed
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| line.starts_with('{'))
                .and_then(|line| serde_json::from_str::<Value>(line).ok())
                .filter(Value::is_object)
        })?;

    let object = record.as_object()?;
    if object.contains_key(RESERVED_ERROR_KEY) {
        return None;
    }

    Some(
        object
            .iter()
            .filter_map(|(k, v)| json_scalar(v).map(|s| (k.clone(), s)))
            .collect(),
    )
}

fn json_scalar(value: &Value) -> Option<ExtractedValue> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(ExtractedValue::Number),
        Value::Bool(b) => Some(ExtractedValue::Bool(*b)),
        Value::String(s) => Some(ExtractedValue::Text(s.clone())),
        _ => None,
    }
}

fn parse_key_values(stdout: &str) -> ExtractedValues {
    let mut values = ExtractedValues::new();

    for line in stdout.lines() {
        let Some(caps) = KEY_VALUE_RE.captures(line) else {
            continue;
        };
        let (Some(key), Some(raw)) = (caps.get(1), caps.get(2)) else {
            continue;
        };

        let key = key.as_str().trim();
        if key.eq_ignore_ascii_case(RESERVED_ERROR_KEY) {
            continue;
        }

        values.insert(key.to_string(), text_scalar(raw.as_str()));
    }

    values
}

fn text_scalar(raw: &str) -> ExtractedValue {
    let raw = raw.trim();
    let cleaned: String = raw
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',' && *c != '_')
        .collect();

    if cleaned.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(n) = cleaned.parse::<f64>() {
            if n.is_finite() {
                return ExtractedValue::Number(n);
            }
        }
    }

    match raw.to_ascii_lowercase().as_str() {
        "true" => ExtractedValue::Bool(true),
        "false" => ExtractedValue::Bool(false),
        _ => ExtractedValue::Text(raw.trim_matches(|c| c == '"' || c == '\'').to_string()),
    }
}

fn render_statement(values: &ExtractedValues) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

//
// ================= Gate =================
//

/// Deterministic telemetry -> fact converter
#[derive(Debug, Clone, Copy, Default)]
pub struct FactExtractionGate;

impl FactExtractionGate {
    pub fn new() -> Self {
        Self
    }

    /// Turn one telemetry record into a fact, or say why not.
    ///
    /// Rejections are reported, never retried here.
    pub fn extract(
        &self,
        telemetry: &ExecutionTelemetry,
        ctx: &ExtractionContext<'_>,
    ) -> ExtractionOutcome {
        if telemetry.status != ExecutionStatus::Success {
            debug!(status = ?telemetry.status, "Extraction rejected: execution did not succeed");
            return ExtractionOutcome::Rejected(RejectionReason::ExecutionFailed {
                status: telemetry.status,
            });
        }

        let expected = compute_fingerprint(ctx.code);
        if expected != telemetry.code_fingerprint {
            return ExtractionOutcome::Rejected(RejectionReason::FingerprintMismatch {
                expected,
                actual: telemetry.code_fingerprint.clone(),
            });
        }

        let (values, method) = match parse_stdout(&telemetry.stdout) {
            ParsedOutput::Parsed(values) => (values, ExtractionMethod::Structured),
            ParsedOutput::KeyValueFallback(values) => (values, ExtractionMethod::KeyValue),
            ParsedOutput::Rejected => {
                debug!("Extraction rejected: no numeric value in stdout");
                return ExtractionOutcome::Rejected(RejectionReason::NoNumericValueFound);
            }
        };

        let (source, freshness) = if ctx.provenance.is_empty() {
            (COMPUTED_SOURCE.to_string(), telemetry.completed_at)
        } else {
            let mut providers: Vec<&str> =
                ctx.provenance.iter().map(|p| p.provider.as_str()).collect();
            providers.sort_unstable();
            providers.dedup();

            let oldest = ctx
                .provenance
                .iter()
                .map(|p| p.fetched_at)
                .min()
                .unwrap_or(telemetry.completed_at);

            (providers.join(", "), oldest)
        };

        let fact = VerifiedFact {
            fact_id: Uuid::new_v4(),
            query_id: ctx.query_id,
            execution_id: telemetry.execution_id,
            code_fingerprint: telemetry.code_fingerprint.clone(),
            statement: render_statement(&values),
            extracted_values: values,
            confidence: 1.0,
            source,
            freshness,
            source_verified: true,
            created_at: Utc::now(),
            notes: Vec::new(),
        };

        info!(
            fact_id = %fact.fact_id,
            fingerprint = %fact.code_fingerprint,
            fields = fact.extracted_values.len(),
            method = ?method,
            "Verified fact extracted"
        );

        ExtractionOutcome::Extracted { fact, method }
    }
}
