//! Deterministic general-purpose signal adapter.
//!
//! Cheap textual signals that apply to any language in the tree: injection
//! sinks, shell execution over tainted strings, secrets committed as
//! literals. Confidence sits below the uncorroborated gate on purpose; these
//! signals earn emission by corroborating a smarter scanner or an explicit
//! marker.

use std::path::Path;

use crate::finding::{Finding, Severity, VulnClass};

use super::{Scanner, marker_findings};

const CLASSES: &[VulnClass] = &[
    VulnClass::SqlInjection,
    VulnClass::CommandInjection,
    VulnClass::PathTraversal,
    VulnClass::HardcodedSecret,
    VulnClass::UnvalidatedInput,
    VulnClass::IntegerOverflow,
    VulnClass::Other,
];

const SQL_KEYWORDS: &[&str] = &["SELECT ", "INSERT ", "UPDATE ", "DELETE FROM"];
const SECRET_KEYS: &[&str] = &["api_key", "apikey", "secret", "password", "private_key"];

pub struct DeterministicSignalsScanner;

impl Scanner for DeterministicSignalsScanner {
    fn id(&self) -> &'static str {
        "deterministic_signals"
    }

    fn scan_file(&self, path: &Path, source: &str) -> Vec<Finding> {
        let mut findings = marker_findings(self.id(), CLASSES, path, source);

        for (idx, line) in source.lines().enumerate() {
            let trimmed = line.trim();
            let line_no = idx + 1;

            if let Some(finding) = sql_concat_signal(self.id(), path, trimmed, line_no) {
                findings.push(finding);
            }
            if let Some(finding) = shell_exec_signal(self.id(), path, trimmed, line_no) {
                findings.push(finding);
            }
            if let Some(finding) = hardcoded_secret_signal(self.id(), path, trimmed, line_no) {
                findings.push(finding);
            }
        }

        findings
    }
}

fn sql_concat_signal(
    scanner_id: &'static str,
    path: &Path,
    line: &str,
    line_no: usize,
) -> Option<Finding> {
    let has_keyword = SQL_KEYWORDS.iter().any(|kw| line.contains(kw));
    let concatenates = line.contains("format!") || line.contains("+ ") || line.contains("${");
    (has_keyword && concatenates).then(|| {
        Finding::new(
            scanner_id,
            VulnClass::SqlInjection,
            Severity::High,
            60,
            path.to_path_buf(),
            line_no,
            "sql statement built by string concatenation",
            "a query keyword appears in a concatenated or interpolated string",
            line.to_string(),
        )
    })
}

fn shell_exec_signal(
    scanner_id: &'static str,
    path: &Path,
    line: &str,
    line_no: usize,
) -> Option<Finding> {
    let spawns = line.contains("child_process.exec")
        || line.contains("os.system")
        || (line.contains("Command::new") && line.contains("sh"));
    let dynamic = line.contains("format!") || line.contains("${") || line.contains("+ ");
    (spawns && dynamic).then(|| {
        Finding::new(
            scanner_id,
            VulnClass::CommandInjection,
            Severity::High,
            60,
            path.to_path_buf(),
            line_no,
            "shell command built from dynamic input",
            "a subprocess is spawned with an interpolated command string",
            line.to_string(),
        )
    })
}

fn hardcoded_secret_signal(
    scanner_id: &'static str,
    path: &Path,
    line: &str,
    line_no: usize,
) -> Option<Finding> {
    let lower = line.to_lowercase();
    let keyed = SECRET_KEYS.iter().any(|key| lower.contains(key));
    if !keyed || !line.contains('=') {
        return None;
    }
    // Only literals count; reading from the environment is the fix, not the bug.
    let literal = line.contains("\"") && !lower.contains("env") && !lower.contains("getenv");
    let long_enough = line
        .split('"')
        .nth(1)
        .map(|value| value.len() >= 12)
        .unwrap_or(false);
    (literal && long_enough).then(|| {
        Finding::new(
            scanner_id,
            VulnClass::HardcodedSecret,
            Severity::Medium,
            65,
            path.to_path_buf(),
            line_no,
            "credential committed as a string literal",
            "a secret-named binding is assigned a long string literal",
            line.to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_interpolated_sql() {
        let source = "let q = format!(\"SELECT * FROM users WHERE id = {}\", id);\n";
        let found = DeterministicSignalsScanner.scan_file(Path::new("/r/db.rs"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::SqlInjection);
        assert_eq!(found[0].confidence, 60);
    }

    #[test]
    fn parameterized_sql_is_clean() {
        let source = "let q = \"SELECT * FROM users WHERE id = ?\";\n";
        let found = DeterministicSignalsScanner.scan_file(Path::new("/r/db.rs"), source);
        assert!(found.is_empty());
    }

    #[test]
    fn flags_dynamic_shell_exec() {
        let source = "child_process.exec(`ls ${userInput}`);\n";
        let found = DeterministicSignalsScanner.scan_file(Path::new("/r/run.ts"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::CommandInjection);
    }

    #[test]
    fn flags_long_literal_secret_but_not_env_reads() {
        let hardcoded = "let api_key = \"sk-aaaaaaaaaaaaaaaaaaaa\";\n";
        let from_env = "let api_key = std::env::var(\"API_KEY\")?;\n";
        assert_eq!(
            DeterministicSignalsScanner
                .scan_file(Path::new("/r/cfg.rs"), hardcoded)
                .len(),
            1
        );
        assert!(DeterministicSignalsScanner
            .scan_file(Path::new("/r/cfg.rs"), from_env)
            .is_empty());
    }

    #[test]
    fn picks_up_general_purpose_markers() {
        let source = "// HYDRA_VULN:sql_injection\n";
        let found = DeterministicSignalsScanner.scan_file(Path::new("/r/db.py"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].confidence, 88);
    }
}
