//! Temporal integrity analyzer
//!
//! Lexical scan for look-ahead bias relative to an as-of date. Pattern
//! matching only: strings and comments are scanned like code, and offsets
//! whose sign is not a literal are not flagged.
//!
//! The analyzer never fails. Malformed code yields zero violations; the
//! pipeline blocks only on what is actually found.

use crate::models::{Severity, TemporalViolation, ViolationKind};
use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

lazy_static! {
    static ref SHIFT_RE: Regex = Regex::new(
        r"\.(shift|diff|pct_change)\s*\(\s*(?:periods\s*=\s*)?([+-]?\s*\d+)\b"
    )
    .expect("shift pattern must compile");

    static ref DATE_LITERAL_RE: Regex = Regex::new(
        r#"['"](\d{4})[-/](\d{1,2})[-/](\d{1,2})(?:\D|$)"#
    )
    .expect("date literal pattern must compile");

    static ref DATE_CTOR_RE: Regex = Regex::new(
        r"\b(?:datetime|date|Timestamp)\s*\(\s*(\d{4})\s*,\s*(\d{1,2})\s*,\s*(\d{1,2})\b"
    )
    .expect("date constructor pattern must compile");

    static ref TRAILING_INDEX_RE: Regex = Regex::new(
        r"\.(?:iloc|iat)\s*\[\s*-\s*\d+|\.tail\s*\(|\.last\s*\("
    )
    .expect("trailing index pattern must compile");

    static ref DATE_FILTER_RE: Regex = Regex::new(
        r#"(?i)\bas_?of\b|\bcutoff\b|\.truncate\s*\(|\.loc\s*\[\s*:|\.loc\s*\[[^\]]*<|<=?\s*['"]\d{4}[-/]\d{1,2}[-/]\d{1,2}|\bdate\w*\s*<|\bindex\s*<|\.between\s*\("#
    )
    .expect("date filter pattern must compile");

    static ref CENTERED_ROLLING_RE: Regex = Regex::new(
        r"\.rolling\s*\([^)]*\bcenter\s*=\s*True\b"
    )
    .expect("rolling pattern must compile");
}

/// Result of one analysis pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemporalReport {
    pub as_of: Option<NaiveDate>,
    /// True when no as-of date was supplied and nothing was scanned.
    pub skipped: bool,
    pub violations: Vec<TemporalViolation>,
    /// True iff any violation is critical.
    pub blocking: bool,
}

impl TemporalReport {
    pub fn skipped() -> Self {
        Self {
            as_of: None,
            skipped: true,
            violations: Vec::new(),
            blocking: false,
        }
    }

    fn from_violations(as_of: NaiveDate, mut violations: Vec<TemporalViolation>) -> Self {
        violations.sort_by(|a, b| a.line.cmp(&b.line).then(a.kind.cmp(&b.kind)));
        let blocking = violations.iter().any(|v| v.is_critical());

        Self {
            as_of: Some(as_of),
            skipped: false,
            violations,
            blocking,
        }
    }

    pub fn critical(&self) -> impl Iterator<Item = &TemporalViolation> {
        self.violations.iter().filter(|v| v.is_critical())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &TemporalViolation> {
        self.violations.iter().filter(|v| !v.is_critical())
    }

    /// Human-readable reasons, used as regeneration feedback.
    pub fn reasons(&self) -> Vec<String> {
        self.violations
            .iter()
            .map(|v| {
                format!(
                    "line {}: {:?} ({}) - {}",
                    v.line, v.kind, v.severity, v.description
                )
            })
            .collect()
    }
}

/// Stateless analyzer: a pure function of (code, as-of date)
#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalAnalyzer;

impl TemporalAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, code: &str, as_of: Option<NaiveDate>) -> TemporalReport {
        let Some(as_of) = as_of else {
            debug!("No as-of date supplied; temporal analysis skipped");
            return TemporalReport::skipped();
        };

        let start = Instant::now();
        let mut violations = Vec::new();
        let mut date_filter_seen = false;

        for (idx, line) in code.lines().enumerate() {
            let line_no = idx + 1;

            violations.extend(scan_shift(line, line_no));

            if let Some(v) = scan_future_dates(line, line_no, as_of) {
                violations.push(v);
            }

            if let Some(v) = scan_centered_rolling(line, line_no) {
                violations.push(v);
            }

            // A filter earlier on the same line counts as preceding.
            if let Some(m) = TRAILING_INDEX_RE.find(line) {
                let filtered_inline = DATE_FILTER_RE
                    .find(line)
                    .map(|f| f.start() < m.start())
                    .unwrap_or(false);

                if !date_filter_seen && !filtered_inline {
                    violations.push(TemporalViolation {
                        kind: ViolationKind::TrailingIndexWithoutFilter,
                        severity: Severity::Warning,
                        line: line_no,
                        description: format!(
                            "trailing access `{}` with no preceding filter to {}",
                            m.as_str().trim(),
                            as_of
                        ),
                    });
                }
            }

            if DATE_FILTER_RE.is_match(line) {
                date_filter_seen = true;
            }
        }

        let report = TemporalReport::from_violations(as_of, violations);

        debug!(
            violations = report.violations.len(),
            blocking = report.blocking,
            elapsed_us = start.elapsed().as_micros() as u64,
            "Temporal analysis complete"
        );

        report
    }
}

fn scan_shift(line: &str, line_no: usize) -> Vec<TemporalViolation> {
    SHIFT_RE
        .captures_iter(line)
        .filter_map(|caps| {
            let op = caps.get(1)?.as_str();
            let raw: String = caps
                .get(2)?
                .as_str()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let offset: i64 = raw.parse().ok()?;

            if offset >= 0 {
                return None;
            }

            Some(TemporalViolation {
                kind: ViolationKind::LookAheadShift,
                severity: Severity::Critical,
                line: line_no,
                description: format!(
                    "`.{}({})` pulls values from {} period(s) in the future",
                    op,
                    offset,
                    -offset
                ),
            })
        })
        .collect()
}

fn scan_future_dates(line: &str, line_no: usize, as_of: NaiveDate) -> Option<TemporalViolation> {
    let literals = DATE_LITERAL_RE.captures_iter(line);
    let ctors = DATE_CTOR_RE.captures_iter(line);

    let mut future: Vec<NaiveDate> = literals
        .chain(ctors)
        .filter_map(|caps| {
            let y = caps.get(1)?.as_str().parse::<i32>().ok()?;
            let m = caps.get(2)?.as_str().parse::<u32>().ok()?;
            let d = caps.get(3)?.as_str().parse::<u32>().ok()?;
            NaiveDate::from_ymd_opt(y, m, d)
        })
        .filter(|date| *date > as_of)
        .collect();

    if future.is_empty() {
        return None;
    }

    future.sort();
    future.dedup();

    let listed = future
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    Some(TemporalViolation {
        kind: ViolationKind::FutureDateAccess,
        severity: Severity::Critical,
        line: line_no,
        description: format!("date bound(s) {} exceed as-of date {}", listed, as_of),
    })
}

fn scan_centered_rolling(line: &str, line_no: usize) -> Option<TemporalViolation> {
    CENTERED_ROLLING_RE.find(line).map(|_| TemporalViolation {
        kind: ViolationKind::CenteredRollingWindow,
        severity: Severity::Critical,
        line: line_no,
        description: "centered rolling window averages over future observations".to_string(),
    })
}
