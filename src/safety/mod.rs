//! Safety pre-screener
//!
//! Lexical deny-list over generated code. Runs before anything touches the
//! sandbox; a single match means the code unit is never executed.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    DynamicEvaluation,
    ProcessSpawn,
    DynamicImport,
}

impl fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyCategory::DynamicEvaluation => "dynamic_evaluation",
            SafetyCategory::ProcessSpawn => "process_spawn",
            SafetyCategory::DynamicImport => "dynamic_import",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyFinding {
    pub category: SafetyCategory,
    pub pattern: String,
    /// 1-based line of the first match.
    pub line: usize,
}

impl fmt::Display for SafetyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: {} ({})",
            self.line, self.category, self.pattern
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyVerdict {
    Clear,
    Blocked(Vec<SafetyFinding>),
}

impl SafetyVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, SafetyVerdict::Blocked(_))
    }

    pub fn reasons(&self) -> Vec<String> {
        match self {
            SafetyVerdict::Clear => Vec::new(),
            SafetyVerdict::Blocked(findings) => {
                findings.iter().map(|f| f.to_string()).collect()
            }
        }
    }
}

struct DenyRule {
    category: SafetyCategory,
    label: &'static str,
    regex: Regex,
}

fn rule(category: SafetyCategory, label: &'static str, pattern: &str) -> DenyRule {
    DenyRule {
        category,
        label,
        regex: Regex::new(pattern).expect("deny-list pattern must compile"),
    }
}

lazy_static! {
    // `[^.\w]` keeps method calls such as `re.compile(` or `df.eval(` out of
    // the bare-builtin rules.
    static ref DENY_RULES: Vec<DenyRule> = vec![
        rule(SafetyCategory::DynamicEvaluation, "eval(", r"(?:^|[^.\w])eval\s*\("),
        rule(SafetyCategory::DynamicEvaluation, "exec(", r"(?:^|[^.\w])exec\s*\("),
        rule(SafetyCategory::ProcessSpawn, "subprocess", r"\bsubprocess\b"),
        rule(SafetyCategory::ProcessSpawn, "os.system", r"\bos\s*\.\s*system\b"),
        rule(SafetyCategory::ProcessSpawn, "os.popen", r"\bos\s*\.\s*popen\b"),
        rule(SafetyCategory::ProcessSpawn, "os.exec*", r"\bos\s*\.\s*exec\w*"),
        rule(SafetyCategory::ProcessSpawn, "os.spawn*", r"\bos\s*\.\s*spawn\w*"),
        rule(SafetyCategory::ProcessSpawn, "os.fork", r"\bos\s*\.\s*fork\b"),
        rule(SafetyCategory::ProcessSpawn, "pty.spawn", r"\bpty\s*\.\s*spawn\b"),
        // Direct imports and aliases reach the same calls without the `os.` prefix.
        rule(
            SafetyCategory::ProcessSpawn,
            "from os import",
            r"\bfrom\s+os\s+import\s+(?:\*|.*\b(?:system|popen|exec\w*|spawn\w*|fork\w*)\b)",
        ),
        rule(SafetyCategory::ProcessSpawn, "import os as", r"\bimport\s+(?:.*,\s*)?os\s+as\b"),
        rule(SafetyCategory::DynamicEvaluation, "getattr(", r"(?:^|[^.\w])getattr\s*\("),
        rule(SafetyCategory::DynamicEvaluation, "builtins", r"\b__builtins__\b|\bimport\s+builtins\b|\bfrom\s+builtins\b"),
        rule(SafetyCategory::DynamicImport, "__import__", r"__import__"),
        rule(SafetyCategory::DynamicImport, "importlib", r"\bimportlib\b"),
        rule(SafetyCategory::DynamicImport, "compile(", r"(?:^|[^.\w])compile\s*\("),
    ];
}

/// Stateless deny-list screener
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyScreener;

impl SafetyScreener {
    pub fn new() -> Self {
        Self
    }

    /// Scan code line by line. Reports every rule that matches, once, at its
    /// first line.
    pub fn screen(&self, code: &str) -> SafetyVerdict {
        let mut findings = Vec::new();

        for rule in DENY_RULES.iter() {
            let first_line = code
                .lines()
                .enumerate()
                .find(|(_, line)| rule.regex.is_match(line))
                .map(|(idx, _)| idx + 1);

            if let Some(line) = first_line {
                findings.push(SafetyFinding {
                    category: rule.category,
                    pattern: rule.label.to_string(),
                    line,
                });
            }
        }

        if findings.is_empty() {
            SafetyVerdict::Clear
        } else {
            findings.sort_by_key(|f| f.line);
            SafetyVerdict::Blocked(findings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(verdict: &SafetyVerdict) -> Vec<SafetyCategory> {
        match verdict {
            SafetyVerdict::Clear => vec![],
            SafetyVerdict::Blocked(f) => f.iter().map(|f| f.category).collect(),
        }
    }

    #[test]
    fn test_clean_analysis_code_is_clear() {
        let code = r#"
import json, re
import pandas as pd
pattern = re.compile(r"\d+")
df = pd.read_json("prices.json")
print(json.dumps({"value": float(df["close"].mean())}))
"#;
        assert_eq!(SafetyScreener::new().screen(code), SafetyVerdict::Clear);
    }

    #[test]
    fn test_blocks_dynamic_evaluation() {
        let verdict = SafetyScreener::new().screen("x = 1\ny = eval('x + 1')");
        assert_eq!(categories(&verdict), vec![SafetyCategory::DynamicEvaluation]);
        if let SafetyVerdict::Blocked(findings) = verdict {
            assert_eq!(findings[0].line, 2);
        }
    }

    #[test]
    fn test_blocks_process_spawn() {
        let verdict = SafetyScreener::new().screen("import subprocess\nsubprocess.run(['ls'])");
        assert!(verdict.is_blocked());
        assert_eq!(categories(&verdict), vec![SafetyCategory::ProcessSpawn]);

        let verdict = SafetyScreener::new().screen("import os\nos.system('rm -rf /')");
        assert_eq!(categories(&verdict), vec![SafetyCategory::ProcessSpawn]);
    }

    #[test]
    fn test_blocks_dynamic_import() {
        let verdict = SafetyScreener::new().screen("m = __import__('os')");
        assert_eq!(categories(&verdict), vec![SafetyCategory::DynamicImport]);

        let verdict = SafetyScreener::new().screen("code = compile('1', 'f', 'eval')");
        assert_eq!(categories(&verdict), vec![SafetyCategory::DynamicImport]);
    }

    fn patterns(verdict: &SafetyVerdict) -> Vec<String> {
        match verdict {
            SafetyVerdict::Clear => vec![],
            SafetyVerdict::Blocked(f) => f.iter().map(|f| f.pattern.clone()).collect(),
        }
    }

    #[test]
    fn test_blocks_direct_import_from_os() {
        let verdict = SafetyScreener::new().screen("from os import system\nsystem('rm -rf /')");
        assert_eq!(categories(&verdict), vec![SafetyCategory::ProcessSpawn]);
        assert_eq!(patterns(&verdict), vec!["from os import"]);

        let verdict = SafetyScreener::new().screen("from os import path, popen");
        assert!(verdict.is_blocked());
        let verdict = SafetyScreener::new().screen("from os import *");
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_blocks_aliased_os_module() {
        let verdict = SafetyScreener::new().screen("import os as o\no.system('ls')");
        assert_eq!(patterns(&verdict), vec!["import os as"]);

        let verdict = SafetyScreener::new().screen("import json, os as o");
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_blocks_getattr_on_builtins() {
        let verdict = SafetyScreener::new().screen("getattr(__builtins__, 'ev'+'al')('1')");
        assert_eq!(
            categories(&verdict),
            vec![SafetyCategory::DynamicEvaluation, SafetyCategory::DynamicEvaluation]
        );
        let found = patterns(&verdict);
        assert!(found.contains(&"getattr(".to_string()));
        assert!(found.contains(&"builtins".to_string()));
    }

    #[test]
    fn test_blocks_getattr_on_os() {
        let verdict = SafetyScreener::new().screen("import os\ngetattr(os, 'system')('ls')");
        assert_eq!(patterns(&verdict), vec!["getattr("]);
        if let SafetyVerdict::Blocked(findings) = verdict {
            assert_eq!(findings[0].line, 2);
        }
    }

    #[test]
    fn test_os_path_usage_is_clear() {
        let code = "import os\nfrom os import path\np = os.path.join(os.environ['SANDBOX_DATA_DIR'], 'px.json')";
        assert_eq!(SafetyScreener::new().screen(code), SafetyVerdict::Clear);
    }

    #[test]
    fn test_method_named_eval_is_not_builtin() {
        let verdict = SafetyScreener::new().screen("model.eval()\ndf.eval('a + b')");
        assert_eq!(verdict, SafetyVerdict::Clear);
    }

    #[test]
    fn test_reasons_mention_line() {
        let verdict = SafetyScreener::new().screen("\n\nexec('print(1)')");
        let reasons = verdict.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("line 3"));
    }
}
