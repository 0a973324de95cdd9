//! Adversarial reviewer
//!
//! Second pass over a verified fact. Deterministic checks look for
//! implausible or inconsistent statistics and carry temporal findings
//! forward; the result is a verdict plus a confidence penalty. Only the
//! fact's confidence and notes are touched, never its values.

use crate::models::{
    ReviewConcern, ReviewResult, ReviewVerdict, Severity, VerifiedFact, ViolationKind,
};
use crate::temporal::TemporalReport;
use chrono::{NaiveDate, Utc};
use tracing::info;

/// Share of current confidence kept after a critical temporal finding.
const TEMPORAL_CRITICAL_FACTOR: f64 = 0.60;
/// Share kept after a critical statistical finding.
const STATISTICAL_CRITICAL_FACTOR: f64 = 0.75;
/// Share kept per warning.
const WARNING_FACTOR: f64 = 0.90;
const MAX_PENALISED_WARNINGS: usize = 3;

const SMALL_SAMPLE: f64 = 30.0;
const SUSPICIOUS_CORRELATION: f64 = 0.95;
const HIGH_SHARPE: f64 = 4.0;
const IMPLAUSIBLE_SHARPE: f64 = 10.0;
const CONSISTENCY_TOLERANCE: f64 = 0.05;
const WIN_RATE_TOLERANCE: f64 = 0.02;

/// Everything a check may look at
pub struct ReviewInput<'a> {
    pub fact: &'a VerifiedFact,
    pub code: &'a str,
    pub temporal: &'a TemporalReport,
    pub as_of: Option<NaiveDate>,
}

impl<'a> ReviewInput<'a> {
    /// Numeric values with normalised keys (`R Squared` -> `r_squared`).
    fn metrics(&self) -> Vec<(String, f64)> {
        self.fact
            .extracted_values()
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (normalise_key(k), n)))
            .collect()
    }

    fn metric(&self, names: &[&str]) -> Option<f64> {
        self.metrics()
            .into_iter()
            .find(|(k, _)| names.contains(&k.as_str()))
            .map(|(_, v)| v)
    }
}

fn normalise_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingClass {
    Temporal,
    Statistical,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub class: FindingClass,
    /// Result is statistically not believable.
    pub implausible: bool,
    /// Critical look-ahead in the code that produced the fact.
    pub look_ahead: bool,
    pub message: String,
    pub suggestion: Option<String>,
}

impl Finding {
    fn statistical(severity: Severity, message: String) -> Self {
        Self {
            severity,
            class: FindingClass::Statistical,
            implausible: false,
            look_ahead: false,
            message,
            suggestion: None,
        }
    }

    fn implausible(mut self) -> Self {
        self.implausible = true;
        self
    }

    fn suggest(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// One reviewer check
pub trait ReviewCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding>;
}

//
// ================= Reviewer =================
//

pub struct AdversarialReviewer {
    checks: Vec<Box<dyn ReviewCheck>>,
}

impl AdversarialReviewer {
    /// Reviewer with no checks; everything is accepted.
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    pub fn add_check(&mut self, check: Box<dyn ReviewCheck>) {
        self.checks.push(check);
    }

    /// Review `fact` in place and report what was found.
    pub fn review(
        &self,
        fact: &mut VerifiedFact,
        code: &str,
        temporal: &TemporalReport,
        as_of: Option<NaiveDate>,
    ) -> ReviewResult {
        let findings: Vec<(&'static str, Finding)> = {
            let input = ReviewInput {
                fact: &*fact,
                code,
                temporal,
                as_of,
            };
            self.checks
                .iter()
                .flat_map(|c| c.check(&input).into_iter().map(move |f| (c.name(), f)))
                .collect()
        };

        let before = fact.confidence();
        let mut confidence = before;

        let critical_temporal = findings
            .iter()
            .any(|(_, f)| f.is_critical() && f.class == FindingClass::Temporal);
        let critical_statistical = findings
            .iter()
            .any(|(_, f)| f.is_critical() && f.class == FindingClass::Statistical);
        let look_ahead = findings.iter().any(|(_, f)| f.look_ahead);
        let implausible = findings.iter().any(|(_, f)| f.implausible);
        let warnings = findings
            .iter()
            .filter(|(_, f)| f.severity == Severity::Warning)
            .count();

        if critical_temporal {
            confidence *= TEMPORAL_CRITICAL_FACTOR;
        }
        if critical_statistical {
            confidence *= STATISTICAL_CRITICAL_FACTOR;
        }
        confidence *= WARNING_FACTOR.powi(warnings.min(MAX_PENALISED_WARNINGS) as i32);

        let verdict = if look_ahead && implausible {
            confidence = 0.0;
            ReviewVerdict::Reject
        } else if critical_temporal || critical_statistical {
            ReviewVerdict::Challenge
        } else {
            ReviewVerdict::Accept
        };

        fact.set_confidence(confidence);
        let after = fact.confidence();
        fact.add_note(format!(
            "review: {:?}, {} concern(s), confidence {:.3} -> {:.3}",
            verdict,
            findings.len(),
            before,
            after
        ));

        let mut suggestions: Vec<String> = Vec::new();
        for (_, finding) in &findings {
            if let Some(s) = &finding.suggestion {
                if !suggestions.contains(s) {
                    suggestions.push(s.clone());
                }
            }
        }

        info!(
            fact_id = %fact.fact_id(),
            verdict = ?verdict,
            concerns = findings.len(),
            confidence_before = before,
            confidence_after = after,
            "Review completed"
        );

        ReviewResult {
            verdict,
            concerns: findings
                .into_iter()
                .map(|(check, f)| ReviewConcern {
                    check: check.to_string(),
                    severity: f.severity,
                    message: f.message,
                })
                .collect(),
            confidence_penalty: (before - after).max(0.0),
            confidence_before: before,
            confidence_after: after,
            suggestions,
            reviewed_at: Utc::now(),
        }
    }
}

impl Default for AdversarialReviewer {
    fn default() -> Self {
        create_default_reviewer()
    }
}

/// Reviewer with every built-in check
pub fn create_default_reviewer() -> AdversarialReviewer {
    let mut reviewer = AdversarialReviewer::empty();
    reviewer.add_check(Box::new(SampleSizeCheck));
    reviewer.add_check(Box::new(MetricRangeCheck));
    reviewer.add_check(Box::new(ConsistencyCheck));
    reviewer.add_check(Box::new(TemporalCheck));
    reviewer.add_check(Box::new(AsOfCheck));
    reviewer
}

//
// ================= Checks =================
//

const SAMPLE_SIZE_KEYS: &[&str] = &[
    "n",
    "sample_size",
    "n_obs",
    "nobs",
    "n_samples",
    "observations",
    "num_observations",
];
const CORRELATION_KEYS: &[&str] = &["corr", "correlation", "r", "pearson_r", "spearman_r"];
const R_SQUARED_KEYS: &[&str] = &["r2", "r_squared", "rsquared", "r²"];
const WIN_RATE_KEYS: &[&str] = &["win_rate", "hit_rate"];

fn is_correlation(key: &str) -> bool {
    CORRELATION_KEYS.contains(&key)
        || key.contains("correlation")
        || key.starts_with("corr_")
        || key.ends_with("_corr")
}

fn is_unit_interval(key: &str) -> bool {
    R_SQUARED_KEYS.contains(&key)
        || key.contains("r_squared")
        || key == "p"
        || key == "pvalue"
        || key.contains("p_value")
        || key == "prob"
        || key.contains("probability")
}

fn is_volatility(key: &str) -> bool {
    key.contains("volatility") || key == "vol" || key == "std" || key == "stdev"
}

pub struct SampleSizeCheck;

impl ReviewCheck for SampleSizeCheck {
    fn name(&self) -> &'static str {
        "sample_size"
    }

    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        let Some(n) = input.metric(SAMPLE_SIZE_KEYS) else {
            return Vec::new();
        };

        let finding = if n < 0.0 || n.fract() != 0.0 {
            Finding::statistical(
                Severity::Critical,
                format!("sample size {} is not a valid count", n),
            )
            .implausible()
        } else if n < 2.0 {
            Finding::statistical(
                Severity::Critical,
                format!("sample size {} cannot support a statistic", n),
            )
            .implausible()
            .suggest("widen the date range or check the data filter")
        } else if n < SMALL_SAMPLE {
            Finding::statistical(
                Severity::Warning,
                format!("small sample size ({})", n),
            )
            .suggest("report a confidence interval alongside the estimate")
        } else {
            return Vec::new();
        };

        vec![finding]
    }
}

pub struct MetricRangeCheck;

impl ReviewCheck for MetricRangeCheck {
    fn name(&self) -> &'static str {
        "metric_range"
    }

    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();

        for (key, v) in input.metrics() {
            if is_correlation(&key) {
                if v.abs() > 1.0 {
                    findings.push(
                        Finding::statistical(
                            Severity::Critical,
                            format!("{} = {} is outside [-1, 1]", key, v),
                        )
                        .implausible(),
                    );
                } else if v.abs() >= SUSPICIOUS_CORRELATION {
                    findings.push(
                        Finding::statistical(
                            Severity::Warning,
                            format!("{} = {} is unrealistically strong", key, v),
                        )
                        .implausible()
                        .suggest("check for overlapping or look-ahead aligned series"),
                    );
                }
            } else if is_unit_interval(&key) {
                if !(0.0..=1.0).contains(&v) {
                    findings.push(
                        Finding::statistical(
                            Severity::Critical,
                            format!("{} = {} is outside [0, 1]", key, v),
                        )
                        .implausible(),
                    );
                }
            } else if is_volatility(&key) {
                if v < 0.0 {
                    findings.push(
                        Finding::statistical(
                            Severity::Critical,
                            format!("{} = {} is negative", key, v),
                        )
                        .implausible(),
                    );
                }
            } else if key.contains("sharpe") {
                if v.abs() > IMPLAUSIBLE_SHARPE {
                    findings.push(
                        Finding::statistical(
                            Severity::Critical,
                            format!("{} = {} is not achievable in practice", key, v),
                        )
                        .implausible()
                        .suggest("check return annualisation and the risk-free rate"),
                    );
                } else if v.abs() > HIGH_SHARPE {
                    findings.push(
                        Finding::statistical(
                            Severity::Warning,
                            format!("{} = {} is unusually high", key, v),
                        )
                        .suggest("check return annualisation and the risk-free rate"),
                    );
                }
            }
        }

        findings
    }
}

pub struct ConsistencyCheck;

impl ReviewCheck for ConsistencyCheck {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();
        let metrics = input.metrics();

        let r2 = input.metric(R_SQUARED_KEYS);
        let corr = metrics
            .iter()
            .find(|(k, _)| is_correlation(k))
            .map(|(_, v)| *v);

        if let (Some(r2), Some(corr)) = (r2, corr) {
            if (r2 - corr * corr).abs() > CONSISTENCY_TOLERANCE {
                findings.push(
                    Finding::statistical(
                        Severity::Critical,
                        format!(
                            "r_squared {} does not match correlation {} (expected {:.4})",
                            r2,
                            corr,
                            corr * corr
                        ),
                    )
                    .suggest("recompute both statistics from the same sample"),
                );
            }
        }

        let wins = input.metric(&["wins", "winning_trades"]);
        let trades = input.metric(&["trades", "total_trades", "num_trades"]);
        if let (Some(wins), Some(trades)) = (wins, trades) {
            if wins > trades || wins < 0.0 {
                findings.push(Finding::statistical(
                    Severity::Critical,
                    format!("{} wins out of {} trades", wins, trades),
                ));
            } else if trades > 0.0 {
                if let Some(rate) = input.metric(WIN_RATE_KEYS) {
                    let rate = if rate > 1.0 { rate / 100.0 } else { rate };
                    let implied = wins / trades;
                    if (rate - implied).abs() > WIN_RATE_TOLERANCE {
                        findings.push(Finding::statistical(
                            Severity::Critical,
                            format!(
                                "win rate {:.4} does not match {}/{} = {:.4}",
                                rate, wins, trades, implied
                            ),
                        ));
                    }
                }
            }
        }

        findings
    }
}

/// Carries every temporal violation into the review
pub struct TemporalCheck;

impl ReviewCheck for TemporalCheck {
    fn name(&self) -> &'static str {
        "temporal_integrity"
    }

    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        input
            .temporal
            .violations
            .iter()
            .map(|v| Finding {
                severity: v.severity,
                class: FindingClass::Temporal,
                implausible: false,
                look_ahead: v.is_critical()
                    && matches!(
                        v.kind,
                        ViolationKind::LookAheadShift
                            | ViolationKind::FutureDateAccess
                            | ViolationKind::CenteredRollingWindow
                    ),
                message: format!("line {}: {}", v.line, v.description),
                suggestion: Some(match v.kind {
                    ViolationKind::LookAheadShift => {
                        "use non-negative shift offsets".to_string()
                    }
                    ViolationKind::FutureDateAccess => {
                        "bound every date range by the as-of date".to_string()
                    }
                    ViolationKind::TrailingIndexWithoutFilter => {
                        "filter the series to the as-of date before taking the last row"
                            .to_string()
                    }
                    ViolationKind::CenteredRollingWindow => {
                        "use trailing rolling windows".to_string()
                    }
                }),
            })
            .collect()
    }
}

pub struct AsOfCheck;

impl ReviewCheck for AsOfCheck {
    fn name(&self) -> &'static str {
        "as_of"
    }

    fn check(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        let Some(as_of) = input.as_of else {
            return Vec::new();
        };

        let computed_on = input.fact.created_at().date_naive();
        if as_of > computed_on {
            vec![Finding::statistical(
                Severity::Warning,
                format!(
                    "as-of date {} is after the computation date {}",
                    as_of, computed_on
                ),
            )]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::compute_fingerprint;
    use crate::extraction::{ExtractionContext, ExtractionOutcome, FactExtractionGate};
    use crate::models::{ExecutionStatus, ExecutionTelemetry, ExtractedValue};
    use crate::temporal::TemporalAnalyzer;
    use uuid::Uuid;

    const CODE: &str = "print(result)";

    fn fact(stdout: &str) -> VerifiedFact {
        let telemetry = ExecutionTelemetry {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Success,
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 5,
            memory_used_kb: None,
            code_fingerprint: compute_fingerprint(CODE),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            block_reasons: vec![],
        };
        let ctx = ExtractionContext {
            query_id: Uuid::new_v4(),
            code: CODE,
            provenance: &[],
        };
        match FactExtractionGate::new().extract(&telemetry, &ctx) {
            ExtractionOutcome::Extracted { fact, .. } => fact,
            other => panic!("fixture did not extract: {:?}", other),
        }
    }

    fn as_of() -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2024, 6, 30)
    }

    fn clean() -> TemporalReport {
        TemporalAnalyzer::new().analyze(CODE, as_of())
    }

    fn look_ahead() -> TemporalReport {
        TemporalAnalyzer::new().analyze("x = s.shift(-5)", as_of())
    }

    #[test]
    fn test_plausible_fact_accepted_unchanged() {
        let mut f = fact(r#"{"metric":"x","value":1.34}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());

        assert_eq!(result.verdict, ReviewVerdict::Accept);
        assert!(result.concerns.is_empty());
        assert_eq!(result.confidence_penalty, 0.0);
        assert_eq!(f.confidence(), 1.0);
    }

    #[test]
    fn test_critical_temporal_challenges_with_penalty() {
        let mut f = fact(r#"{"value": 0.42}"#);
        let report = look_ahead();
        let result = create_default_reviewer().review(&mut f, CODE, &report, as_of());

        assert_eq!(result.verdict, ReviewVerdict::Challenge);
        assert_eq!(result.concerns.len(), report.violations.len());
        assert!((f.confidence() - 0.6).abs() < 1e-9);
        assert!((result.confidence_penalty - 0.4).abs() < 1e-9);
        assert_eq!(f.number("value"), Some(0.42));
    }

    #[test]
    fn test_look_ahead_with_implausible_correlation_rejects() {
        let mut f = fact(r#"{"correlation": 0.99}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &look_ahead(), as_of());

        assert_eq!(result.verdict, ReviewVerdict::Reject);
        assert_eq!(f.confidence(), 0.0);
        assert_eq!(result.confidence_after, 0.0);
        assert_eq!(
            f.extracted_values().get("correlation"),
            Some(&ExtractedValue::Number(0.99))
        );
    }

    #[test]
    fn test_high_correlation_alone_is_warning() {
        let mut f = fact(r#"{"correlation": 0.97}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());

        assert_eq!(result.verdict, ReviewVerdict::Accept);
        assert!((f.confidence() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_statistics_challenge() {
        let mut f = fact(r#"{"r_squared": 1.3}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());

        assert_eq!(result.verdict, ReviewVerdict::Challenge);
        assert!((f.confidence() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_small_and_degenerate_samples() {
        let mut f = fact(r#"{"mean_return": 0.01, "n": 12}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());
        assert_eq!(result.verdict, ReviewVerdict::Accept);
        assert_eq!(result.concerns[0].severity, Severity::Warning);

        let mut f = fact(r#"{"mean_return": 0.01, "n": 1}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());
        assert_eq!(result.verdict, ReviewVerdict::Challenge);
    }

    #[test]
    fn test_inconsistent_r_squared_and_win_rate() {
        let mut f = fact(r#"{"correlation": 0.5, "r_squared": 0.6}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());
        assert!(result.concerns.iter().any(|c| c.check == "consistency"));

        let mut f = fact(r#"{"wins": 30, "trades": 50, "win_rate": 60}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());
        assert!(result.concerns.is_empty());

        let mut f = fact(r#"{"wins": 30, "trades": 50, "win_rate": 0.8}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());
        assert_eq!(result.verdict, ReviewVerdict::Challenge);
    }

    #[test]
    fn test_warning_penalty_is_capped() {
        let mut f = fact(
            r#"{"corr_a": 0.96, "corr_b": 0.97, "corr_c": 0.98, "corr_d": 0.99, "n": 10}"#,
        );
        let result = create_default_reviewer().review(&mut f, CODE, &clean(), as_of());

        assert_eq!(result.verdict, ReviewVerdict::Accept);
        assert_eq!(result.concerns.len(), 5);
        assert!((f.confidence() - 0.9f64.powi(3)).abs() < 1e-9);
    }

    #[test]
    fn test_future_as_of_is_warning() {
        let mut f = fact(r#"{"value": 2.0}"#);
        let future = NaiveDate::from_ymd_opt(2999, 1, 1);
        let report = TemporalAnalyzer::new().analyze(CODE, future);
        let result = create_default_reviewer().review(&mut f, CODE, &report, future);

        assert_eq!(result.verdict, ReviewVerdict::Accept);
        assert_eq!(result.concerns.len(), 1);
        assert_eq!(result.concerns[0].check, "as_of");
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        let mut f = fact(r#"{"correlation": 3.0, "n": -1, "r_squared": 9, "sharpe": 50}"#);
        let result = create_default_reviewer().review(&mut f, CODE, &look_ahead(), as_of());

        assert!((0.0..=1.0).contains(&f.confidence()));
        assert!((0.0..=1.0).contains(&result.confidence_after));
    }
}
