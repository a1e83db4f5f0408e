//! Report collation: JSON, Markdown, and SARIF 2.1.0 renderings of a scan.

use std::fmt::Write as _;

use serde_json::json;

use crate::error::{HydraErr, Result};
use crate::finding::Severity;
use crate::orchestrator::ScanReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Markdown,
    Sarif,
}

impl ReportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "json" => Some(ReportFormat::Json),
            "markdown" => Some(ReportFormat::Markdown),
            "sarif" => Some(ReportFormat::Sarif),
            _ => None,
        }
    }
}

pub fn render(report: &ScanReport, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Json => to_json(report),
        ReportFormat::Markdown => Ok(to_markdown(report)),
        ReportFormat::Sarif => to_sarif(report),
    }
}

pub fn to_json(report: &ScanReport) -> Result<String> {
    serde_json::to_string_pretty(report)
        .map_err(|e| HydraErr::json_parse("report serialization", e))
}

pub fn to_markdown(report: &ScanReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Security audit report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- Target: `{}`", report.target.root.display());
    let _ = writeln!(out, "- Mode: {:?}", report.target.mode);
    let _ = writeln!(out, "- Started: {}", report.started_at.to_rfc3339());
    let _ = writeln!(out, "- Completed: {}", report.completed_at.to_rfc3339());
    let _ = writeln!(out, "- Findings: {}", report.findings.len());
    let _ = writeln!(out);

    if report.findings.is_empty() {
        let _ = writeln!(out, "No findings.");
        return out;
    }

    let _ = writeln!(out, "| Severity | Class | Location | Confidence | Scanners |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for finding in &report.findings {
        let _ = writeln!(
            out,
            "| {} | {} | {}:{} | {} | {} |",
            finding.severity,
            finding.vuln_class,
            finding.file.display(),
            finding.line,
            finding.confidence,
            finding.scanner_id,
        );
    }

    for finding in &report.findings {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {} — {}", finding.severity, finding.title);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Location: `{}:{}`", finding.file.display(), finding.line);
        let _ = writeln!(out, "- Class: `{}`", finding.vuln_class);
        let _ = writeln!(out, "- Id: `{}`", finding.id);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", finding.description);
        if !finding.evidence.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "```\n{}\n```", finding.evidence);
        }
    }

    if !report.patches.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Patches");
        let _ = writeln!(out);
        for patch in &report.patches {
            let _ = writeln!(out, "- `{}`: {:?}", patch.finding_id, patch.status);
        }
    }

    out
}

/// SARIF severity levels: error above medium, note below.
fn sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical | Severity::High => "error",
        Severity::Medium => "warning",
        Severity::Low => "note",
    }
}

pub fn to_sarif(report: &ScanReport) -> Result<String> {
    let mut rule_ids: Vec<&str> = report
        .findings
        .iter()
        .map(|f| f.vuln_class.as_tag())
        .collect();
    rule_ids.sort_unstable();
    rule_ids.dedup();

    let rules: Vec<_> = rule_ids
        .iter()
        .map(|id| json!({"id": id, "name": id}))
        .collect();

    let results: Vec<_> = report
        .findings
        .iter()
        .map(|finding| {
            json!({
                "ruleId": finding.vuln_class.as_tag(),
                "level": sarif_level(finding.severity),
                "message": { "text": format!("{}: {}", finding.title, finding.description) },
                "partialFingerprints": { "findingId": finding.id },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": finding.file.to_string_lossy() },
                        "region": { "startLine": finding.line },
                    },
                }],
            })
        })
        .collect();

    let sarif = json!({
        "$schema": "https://json.schemastore.org/sarif-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "hydra",
                    "informationUri": "https://github.com/hydra-audit/hydra",
                    "rules": rules,
                },
            },
            "results": results,
        }],
    });
    serde_json::to_string_pretty(&sarif)
        .map_err(|e| HydraErr::json_parse("sarif serialization", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::{Finding, VulnClass};
    use crate::target::ScanTarget;
    use crate::threat_model::{ThreatModelStore, ThreatModelVersion};
    use chrono::Utc;
    use std::path::PathBuf;

    fn sample_report() -> ScanReport {
        let root = PathBuf::from("/repo");
        let finding = Finding::new(
            "account_validation",
            VulnClass::MissingSignerCheck,
            Severity::High,
            88,
            root.join("src/lib.rs"),
            42,
            "missing signer check",
            "authority is never verified",
            "let _auth = &ctx.accounts.authority;",
        );
        ScanReport {
            target: ScanTarget::full(root.clone()),
            threat_model: ThreatModelVersion {
                version_id: "abc123".to_string(),
                repo_id: ThreatModelStore::repo_id(&root),
                revision: 1,
                parent_version_id: None,
                schema_version: 1,
                fingerprint: "f".repeat(16),
                summary: Default::default(),
                storage_path: root.join(".hydra/threat-models/x/versions.json"),
                created_at: Utc::now(),
            },
            threat_model_from_cache: false,
            agent_runs: Vec::new(),
            findings: vec![finding],
            adversarial: Vec::new(),
            patches: Vec::new(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            stage_timings: Vec::new(),
        }
    }

    #[test]
    fn json_round_trips() {
        let report = sample_report();
        let raw = to_json(&report).unwrap();
        let parsed: ScanReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.findings[0].line, 42);
    }

    #[test]
    fn markdown_lists_each_finding() {
        let md = to_markdown(&sample_report());
        assert!(md.contains("missing_signer_check"));
        assert!(md.contains("src/lib.rs:42"));
        assert!(md.contains("HIGH"));
    }

    #[test]
    fn sarif_carries_rule_and_region() {
        let raw = to_sarif(&sample_report()).unwrap();
        let sarif: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(sarif["version"], "2.1.0");
        let result = &sarif["runs"][0]["results"][0];
        assert_eq!(result["ruleId"], "missing_signer_check");
        assert_eq!(result["level"], "error");
        assert_eq!(
            result["locations"][0]["physicalLocation"]["region"]["startLine"],
            42
        );
    }

    #[test]
    fn format_parsing_is_closed() {
        assert_eq!(ReportFormat::parse("json"), Some(ReportFormat::Json));
        assert_eq!(ReportFormat::parse("sarif"), Some(ReportFormat::Sarif));
        assert_eq!(ReportFormat::parse("xml"), None);
    }
}
