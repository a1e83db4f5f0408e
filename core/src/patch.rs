//! Patch generation, verification, and acceptance.
//!
//! Eligible findings (verdict confirmed or likely) get a model-proposed
//! unified diff. The diff is applied strictly in memory; if it does not
//! apply, the patch is rejected no matter what the reviewing model said.
//! When a red-team exploit exists and a sandbox is available, the exploit is
//! re-run against the patched source and a still-working exploit overrides
//! any approval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::adversarial::{AdversarialResult, RedTeamAssessment};
use crate::config::EngineConfig;
use crate::finding::Finding;
use crate::reasoner::{CompletionRequest, Reasoner, extract_json};
use crate::sandbox::{SandboxProfile, SandboxSupervisor, SessionOverrides};

const RETEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXPLOIT_GUEST_PATH: &str = "/workspace/exploit.ts";
const PATCHED_GUEST_DIR: &str = "/workspace/patched";
const MAX_SOURCE_CHARS: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchProposal {
    #[serde(default)]
    pub finding_id: String,
    pub file: PathBuf,
    pub unified_diff: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_code: Option<String>,
    #[serde(default)]
    pub breaking_changes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    pub message: String,
}

impl ReviewIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Info,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchReview {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploit_retest_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regression_check_passed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    PatchedAndVerified,
    PatchedNeedsReview,
    PatchRejected,
    NoPatch,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchResult {
    pub finding_id: String,
    pub status: PatchStatus,
    pub proposal: Option<PatchProposal>,
    pub review: Option<PatchReview>,
}

pub struct PatchPipeline {
    reasoner: Option<Arc<dyn Reasoner>>,
    sandbox: Arc<SandboxSupervisor>,
    concurrency: usize,
    skip_review: bool,
}

impl PatchPipeline {
    pub fn new(
        reasoner: Option<Arc<dyn Reasoner>>,
        sandbox: Arc<SandboxSupervisor>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            reasoner,
            sandbox,
            concurrency: config.patch_concurrency.max(1),
            skip_review: config.skip_patch_review,
        }
    }

    /// One result per adversarial input, in input order. Ineligible verdicts
    /// come back as `skipped`; individual failures degrade to `no_patch`.
    pub async fn run(&self, results: &[AdversarialResult]) -> Vec<PatchResult> {
        let mut slots: Vec<Option<PatchResult>> = Vec::new();
        slots.resize_with(results.len(), || None);
        let mut queue: Vec<(usize, PatchInput)> = Vec::new();

        for (index, result) in results.iter().enumerate() {
            let actionable = result
                .judge
                .as_ref()
                .is_some_and(|judge| judge.verdict.is_actionable());
            if actionable {
                queue.push((
                    index,
                    PatchInput {
                        finding: result.finding.clone(),
                        red_team: result.red_team.clone(),
                    },
                ));
            } else {
                slots[index] = Some(PatchResult {
                    finding_id: result.finding.id.clone(),
                    status: PatchStatus::Skipped,
                    proposal: None,
                    review: None,
                });
            }
        }
        queue.reverse();

        let mut in_flight: JoinSet<(usize, PatchResult)> = JoinSet::new();
        loop {
            while in_flight.len() < self.concurrency {
                let Some((index, input)) = queue.pop() else {
                    break;
                };
                let context = PatchContext {
                    reasoner: self.reasoner.clone(),
                    sandbox: self.sandbox.clone(),
                    skip_review: self.skip_review,
                };
                in_flight.spawn(async move {
                    (
                        index,
                        context
                            .patch_finding(&input.finding, input.red_team.as_ref())
                            .await,
                    )
                });
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_error) => warn!(%join_error, "patch task panicked"),
            }
        }

        slots.into_iter().flatten().collect()
    }
}

/// The slice of a debate result the patch flow actually needs.
struct PatchInput {
    finding: Finding,
    red_team: Option<RedTeamAssessment>,
}

struct PatchContext {
    reasoner: Option<Arc<dyn Reasoner>>,
    sandbox: Arc<SandboxSupervisor>,
    skip_review: bool,
}

impl PatchContext {
    async fn patch_finding(
        &self,
        finding: &Finding,
        red: Option<&RedTeamAssessment>,
    ) -> PatchResult {
        let no_patch = |proposal: Option<PatchProposal>| PatchResult {
            finding_id: finding.id.clone(),
            status: PatchStatus::NoPatch,
            proposal,
            review: None,
        };

        let Ok(source) = std::fs::read_to_string(&finding.file) else {
            debug!(file = %finding.file.display(), "source unreadable; no patch");
            return no_patch(None);
        };
        let source_excerpt: String = source.chars().take(MAX_SOURCE_CHARS).collect();

        let Some(mut proposal) = self.generate(finding, &source_excerpt).await else {
            return no_patch(None);
        };
        if proposal.unified_diff.trim().is_empty() {
            return no_patch(Some(proposal));
        }
        proposal.finding_id = finding.id.clone();

        // Strict application decides before any model opinion does.
        let applied = hydra_apply_patch::apply_unified_diff(&source, &proposal.unified_diff);

        let mut review = if self.skip_review {
            let mut review = PatchReview {
                approved: true,
                ..PatchReview::default()
            };
            review
                .issues
                .push(ReviewIssue::info("review agent skipped by configuration"));
            review
        } else {
            self.review(finding, &proposal, &source_excerpt).await
        };

        let patched = match applied {
            Ok(patched) => patched,
            Err(e) => {
                review.approved = false;
                review
                    .issues
                    .push(ReviewIssue::error(format!("patch does not apply: {e}")));
                return PatchResult {
                    finding_id: finding.id.clone(),
                    status: PatchStatus::PatchRejected,
                    proposal: Some(proposal),
                    review: Some(review),
                };
            }
        };

        self.retest(finding, red, &patched, &mut review).await;

        let status = if review.exploit_retest_passed == Some(false) {
            review.approved = false;
            review.issues.push(ReviewIssue::error(
                "exploit still succeeds against the patched source",
            ));
            PatchStatus::PatchRejected
        } else if !review.approved {
            PatchStatus::PatchRejected
        } else if self.skip_review {
            PatchStatus::PatchedNeedsReview
        } else {
            PatchStatus::PatchedAndVerified
        };

        PatchResult {
            finding_id: finding.id.clone(),
            status,
            proposal: Some(proposal),
            review: Some(review),
        }
    }

    async fn generate(&self, finding: &Finding, source: &str) -> Option<PatchProposal> {
        let reasoner = self.reasoner.as_ref()?;
        let request = CompletionRequest {
            system: "You are a security engineer producing minimal fixes. Reply with a JSON \
                     object: {\"file\": string, \"unified_diff\": string, \"explanation\": \
                     string, \"root_cause\": string, \"test_code\": string|null, \
                     \"breaking_changes\": [string]}. The unified_diff must use @@ hunk \
                     headers whose context lines match the given source exactly."
                .to_string(),
            user: format!(
                "Finding: {} [{}] at {}:{}\n\n{}\n\nSource:\n{}",
                finding.title,
                finding.vuln_class,
                finding.file.display(),
                finding.line,
                finding.description,
                source,
            ),
        };
        match reasoner.complete(request).await {
            Ok(reply) => extract_json(&reply)
                .and_then(|v| serde_json::from_value::<PatchProposal>(v).ok()),
            Err(e) => {
                warn!(%e, "patch generation failed");
                None
            }
        }
    }

    async fn review(
        &self,
        finding: &Finding,
        proposal: &PatchProposal,
        source: &str,
    ) -> PatchReview {
        let fallback = |message: String| PatchReview {
            approved: false,
            issues: vec![ReviewIssue::warning(message)],
            ..PatchReview::default()
        };
        let Some(reasoner) = self.reasoner.as_ref() else {
            return fallback("no reasoner configured for review".to_string());
        };
        let request = CompletionRequest {
            system: "You review security patches. Reply with a JSON object: \
                     {\"approved\": bool, \"issues\": [{\"severity\": \
                     \"error\"|\"warning\"|\"info\", \"message\": string}], \
                     \"suggestions\": [string]}."
                .to_string(),
            user: format!(
                "Finding: {} at {}:{}\n\nProposed diff:\n{}\n\nExplanation: {}\n\nSource:\n{}",
                finding.title,
                finding.file.display(),
                finding.line,
                proposal.unified_diff,
                proposal.explanation,
                source,
            ),
        };
        match reasoner.complete(request).await {
            Ok(reply) => extract_json(&reply)
                .and_then(|v| serde_json::from_value::<PatchReview>(v).ok())
                .unwrap_or_else(|| fallback("review reply was not parseable".to_string())),
            Err(e) => fallback(format!("review reasoner failed: {e}")),
        }
    }

    /// Re-run the red-team exploit against the patched source. A failing
    /// exploit is the pass signal. Sandbox unavailability annotates instead
    /// of blocking.
    async fn retest(
        &self,
        finding: &Finding,
        red: Option<&RedTeamAssessment>,
        patched: &str,
        review: &mut PatchReview,
    ) {
        let Some(exploit) = red.and_then(|r| r.exploit_code.as_deref()) else {
            return;
        };
        if !self.sandbox.is_runtime_available().await
            || !self.sandbox.is_image_built(SandboxProfile::Solana).await
        {
            review.issues.push(ReviewIssue::warning(
                "sandbox unavailable; exploit retest not executed",
            ));
            return;
        }

        let session = match self
            .sandbox
            .create(SandboxProfile::Solana, SessionOverrides::default())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                review.issues.push(ReviewIssue::warning(format!(
                    "sandbox create failed; exploit retest not executed: {e}"
                )));
                return;
            }
        };

        let file_name = finding
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "patched.rs".to_string());
        let guest_source = format!("{PATCHED_GUEST_DIR}/{file_name}");

        let run = async {
            session
                .write_file(&guest_source, patched.as_bytes())
                .await?;
            session
                .write_file(EXPLOIT_GUEST_PATH, exploit.as_bytes())
                .await?;
            session
                .exec(
                    &["npx", "--yes", "tsx", EXPLOIT_GUEST_PATH, &guest_source],
                    Some(RETEST_TIMEOUT),
                )
                .await
        };
        match run.await {
            Ok(outcome) => {
                review.exploit_retest_passed = Some(outcome.exit_code != 0);
            }
            Err(e) => {
                review.issues.push(ReviewIssue::warning(format!(
                    "exploit retest errored; treated as not executed: {e}"
                )));
            }
        }
        session.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adversarial::{JudgeRuling, Verdict};
    use crate::finding::{Severity, VulnClass};
    use crate::reasoner::test_support::ScriptedReasoner;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn offline_sandbox() -> Arc<SandboxSupervisor> {
        Arc::new(SandboxSupervisor::with_runtime("hydra-no-such-runtime"))
    }

    fn adversarial_input(dir: &Path, verdict: Verdict) -> (AdversarialResult, PathBuf) {
        let file = dir.join("lib.rs");
        std::fs::write(&file, "fn withdraw() {\n    transfer();\n}\n").unwrap();
        let finding = Finding::new(
            "account_validation",
            VulnClass::MissingSignerCheck,
            Severity::High,
            88,
            file.clone(),
            2,
            "missing signer check",
            "authority never verified",
            "transfer();",
        );
        let result = AdversarialResult {
            finding,
            red_team: Some(RedTeamAssessment::default()),
            blue_team: None,
            judge: Some(JudgeRuling {
                verdict,
                final_severity: Severity::High,
                final_confidence: 85,
                reasoning: "r".to_string(),
                evidence_summary: String::new(),
            }),
        };
        (result, file)
    }

    fn proposal_reply(diff: &str) -> String {
        serde_json::json!({
            "file": "lib.rs",
            "unified_diff": diff,
            "explanation": "require a signer",
            "root_cause": "unchecked authority",
            "test_code": null,
            "breaking_changes": [],
        })
        .to_string()
    }

    #[tokio::test]
    async fn applies_and_verifies_a_clean_patch() {
        let dir = tempfile::tempdir().unwrap();
        let (input, _) = adversarial_input(dir.path(), Verdict::Confirmed);
        let diff = "@@ -1,2 +1,3 @@\n fn withdraw() {\n+    require_signer();\n     transfer();\n";
        let review = r#"{"approved": true, "issues": [], "suggestions": []}"#;
        let reasoner: Arc<dyn Reasoner> =
            Arc::new(ScriptedReasoner::new([proposal_reply(diff), review.to_string()]));

        let pipeline = PatchPipeline::new(
            Some(reasoner),
            offline_sandbox(),
            &EngineConfig::default(),
        );
        let results = pipeline.run(std::slice::from_ref(&input)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, PatchStatus::PatchedAndVerified);
        assert!(results[0].review.as_ref().unwrap().approved);
    }

    #[tokio::test]
    async fn unmatched_context_rejects_despite_approval() {
        let dir = tempfile::tempdir().unwrap();
        let (input, _) = adversarial_input(dir.path(), Verdict::Likely);
        let diff = "@@ -1,2 +1,2 @@\n fn totally_different() {\n-    transfer();\n+    checked();\n";
        let review = r#"{"approved": true, "issues": [], "suggestions": []}"#;
        let reasoner: Arc<dyn Reasoner> =
            Arc::new(ScriptedReasoner::new([proposal_reply(diff), review.to_string()]));

        let pipeline = PatchPipeline::new(
            Some(reasoner),
            offline_sandbox(),
            &EngineConfig::default(),
        );
        let results = pipeline.run(std::slice::from_ref(&input)).await;
        assert_eq!(results[0].status, PatchStatus::PatchRejected);
        let review = results[0].review.as_ref().unwrap();
        assert!(review.issues.iter().any(|issue| {
            issue.severity == IssueSeverity::Error && issue.message.contains("does not apply")
        }));
    }

    #[tokio::test]
    async fn non_actionable_verdicts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (input, _) = adversarial_input(dir.path(), Verdict::FalsePositive);
        let pipeline = PatchPipeline::new(None, offline_sandbox(), &EngineConfig::default());
        let results = pipeline.run(&[input]).await;
        assert_eq!(results[0].status, PatchStatus::Skipped);
    }

    #[tokio::test]
    async fn reasoner_failure_degrades_to_no_patch() {
        let dir = tempfile::tempdir().unwrap();
        let (input, _) = adversarial_input(dir.path(), Verdict::Confirmed);
        let pipeline = PatchPipeline::new(
            Some(Arc::new(ScriptedReasoner::garbage(1))),
            offline_sandbox(),
            &EngineConfig::default(),
        );
        let results = pipeline.run(&[input]).await;
        assert_eq!(results[0].status, PatchStatus::NoPatch);
    }

    #[tokio::test]
    async fn skip_review_marks_patch_as_needing_review() {
        let dir = tempfile::tempdir().unwrap();
        let (input, _) = adversarial_input(dir.path(), Verdict::Confirmed);
        let diff = "@@ -1,2 +1,3 @@\n fn withdraw() {\n+    require_signer();\n     transfer();\n";
        let reasoner: Arc<dyn Reasoner> = Arc::new(ScriptedReasoner::new([proposal_reply(diff)]));

        let mut config = EngineConfig::default();
        config.skip_patch_review = true;
        let pipeline = PatchPipeline::new(Some(reasoner), offline_sandbox(), &config);
        let results = pipeline.run(&[input]).await;
        assert_eq!(results[0].status, PatchStatus::PatchedNeedsReview);
    }
}
