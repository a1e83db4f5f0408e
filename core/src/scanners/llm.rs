//! LLM-backed focus scanners.
//!
//! One task per vulnerability focus, each prompting the reasoner over a
//! bounded excerpt of the tree and schema-parsing the reply. Anything the
//! model returns that does not fit the closed finding schema is dropped;
//! a reasoner failure fails only this agent's run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::dispatcher::AgentTask;
use crate::error::Result;
use crate::finding::{Finding, Severity, VulnClass};
use crate::reasoner::{CompletionRequest, Reasoner, extract_json};

use super::walk_source_files;

const MAX_FILES_PER_PROMPT: usize = 12;
const MAX_BYTES_PER_FILE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VulnFocus {
    AccessControl,
    Arithmetic,
    CpiSafety,
    InputValidation,
}

impl VulnFocus {
    pub const ALL: &'static [VulnFocus] = &[
        VulnFocus::AccessControl,
        VulnFocus::Arithmetic,
        VulnFocus::CpiSafety,
        VulnFocus::InputValidation,
    ];

    pub fn agent_id(&self) -> &'static str {
        match self {
            VulnFocus::AccessControl => "llm_access_control",
            VulnFocus::Arithmetic => "llm_arithmetic",
            VulnFocus::CpiSafety => "llm_cpi_safety",
            VulnFocus::InputValidation => "llm_input_validation",
        }
    }

    fn brief(&self) -> &'static str {
        match self {
            VulnFocus::AccessControl => {
                "missing signer or owner checks, privilege escalation, authority confusion"
            }
            VulnFocus::Arithmetic => {
                "integer overflow and underflow, unchecked math on balances and supply"
            }
            VulnFocus::CpiSafety => {
                "arbitrary cross-program invocation, unpinned program ids, unsafe delegation"
            }
            VulnFocus::InputValidation => {
                "unvalidated instruction data, injection sinks, path traversal"
            }
        }
    }
}

/// Raw model-side finding shape; anything that fails to parse into the
/// closed enums is discarded.
#[derive(Debug, Deserialize)]
struct RawFinding {
    vuln_class: String,
    severity: String,
    confidence: u8,
    file: String,
    line: usize,
    title: String,
    description: String,
    #[serde(default)]
    evidence: String,
}

pub struct LlmScanner {
    focus: VulnFocus,
    reasoner: Arc<dyn Reasoner>,
}

impl LlmScanner {
    pub fn new(focus: VulnFocus, reasoner: Arc<dyn Reasoner>) -> Self {
        Self { focus, reasoner }
    }

    pub fn into_task(self, root: PathBuf, timeout: Duration) -> AgentTask {
        let agent_id = self.focus.agent_id();
        AgentTask::new(agent_id, async move { self.scan(&root).await }).with_timeout(timeout)
    }

    async fn scan(&self, root: &Path) -> Result<Vec<Finding>> {
        let excerpt = build_excerpt(root);
        if excerpt.is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionRequest {
            system: format!(
                "You are a security auditor focused on: {}. Report findings as a JSON \
                 array of objects with keys vuln_class, severity, confidence, file, \
                 line, title, description, evidence. Use only these vuln_class tags: \
                 missing_signer_check, missing_owner_check, arbitrary_cpi, \
                 non_canonical_bump, account_reinit, duplicate_mutable_accounts, \
                 type_cosplay, integer_overflow, missing_freeze_authority_check, \
                 oracle_staleness, sql_injection, command_injection, path_traversal, \
                 hardcoded_secret, unvalidated_input, other. Severity is one of \
                 critical, high, medium, low. Reply with the JSON array only.",
                self.focus.brief()
            ),
            user: excerpt,
        };

        let reply = self.reasoner.complete(request).await?;
        Ok(parse_findings(self.focus.agent_id(), root, &reply))
    }
}

fn build_excerpt(root: &Path) -> String {
    let mut excerpt = String::new();
    for file in walk_source_files(root).into_iter().take(MAX_FILES_PER_PROMPT) {
        let Ok(source) = std::fs::read_to_string(&file) else {
            continue;
        };
        let rel = file.strip_prefix(root).unwrap_or(&file);
        let clipped: String = source.chars().take(MAX_BYTES_PER_FILE).collect();
        excerpt.push_str(&format!("--- {} ---\n{clipped}\n", rel.display()));
    }
    excerpt
}

fn parse_findings(agent_id: &'static str, root: &Path, reply: &str) -> Vec<Finding> {
    let Some(value) = extract_json(reply) else {
        debug!(agent_id, "reasoner reply carried no parseable json");
        return Vec::new();
    };
    let Ok(raw) = serde_json::from_value::<Vec<RawFinding>>(value) else {
        debug!(agent_id, "reasoner reply did not match the finding schema");
        return Vec::new();
    };

    raw.into_iter()
        .filter_map(|item| {
            let vuln_class = VulnClass::parse_tag(&item.vuln_class)?;
            let severity = parse_severity(&item.severity)?;
            let file = if Path::new(&item.file).is_absolute() {
                PathBuf::from(&item.file)
            } else {
                root.join(&item.file)
            };
            Some(Finding::new(
                agent_id,
                vuln_class,
                severity,
                item.confidence.min(100),
                file,
                item.line.max(1),
                item.title,
                item.description,
                item.evidence,
            ))
        })
        .collect()
}

fn parse_severity(raw: &str) -> Option<Severity> {
    match raw.to_lowercase().as_str() {
        "critical" => Some(Severity::Critical),
        "high" => Some(Severity::High),
        "medium" => Some(Severity::Medium),
        "low" => Some(Severity::Low),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoner::test_support::ScriptedReasoner;
    use pretty_assertions::assert_eq;

    fn fixture_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn parses_well_formed_reply() {
        let dir = fixture_root();
        let reply = r#"[{"vuln_class": "missing_signer_check", "severity": "high",
            "confidence": 72, "file": "src/lib.rs", "line": 1,
            "title": "unchecked authority", "description": "d", "evidence": "e"}]"#;
        let scanner = LlmScanner::new(
            VulnFocus::AccessControl,
            Arc::new(ScriptedReasoner::new([reply])),
        );
        let found = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].scanner_id, "llm_access_control");
        assert_eq!(found[0].file, dir.path().join("src/lib.rs"));
    }

    #[tokio::test]
    async fn unparseable_reply_yields_no_findings() {
        let dir = fixture_root();
        let scanner = LlmScanner::new(
            VulnFocus::Arithmetic,
            Arc::new(ScriptedReasoner::garbage(1)),
        );
        let found = scanner.scan(dir.path()).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unknown_tags_are_dropped_entry_by_entry() {
        let dir = fixture_root();
        let reply = r#"[
            {"vuln_class": "made_up", "severity": "high", "confidence": 90,
             "file": "src/lib.rs", "line": 1, "title": "t", "description": "d"},
            {"vuln_class": "arbitrary_cpi", "severity": "medium", "confidence": 60,
             "file": "src/lib.rs", "line": 1, "title": "t", "description": "d"}
        ]"#;
        let scanner = LlmScanner::new(
            VulnFocus::CpiSafety,
            Arc::new(ScriptedReasoner::new([reply])),
        );
        let found = scanner.scan(dir.path()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::ArbitraryCpi);
    }
}
