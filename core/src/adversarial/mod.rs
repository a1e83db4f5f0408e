//! Adversarial validation of aggregated findings.
//!
//! Each eligible finding goes through a strictly ordered three-role debate:
//! the red team argues exploitability (optionally proving it in a sandbox),
//! the blue team argues mitigation, and a judge arbitrates into a typed
//! verdict. Debates across findings run with bounded concurrency; a failure
//! in any role degrades that role to a conservative default and the
//! pipeline always produces a complete result per finding.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::finding::Finding;
use crate::reasoner::{CompletionRequest, Reasoner, extract_json};
use crate::sandbox::{SandboxProfile, SandboxSupervisor, SessionOverrides};

mod prompts;
mod types;

pub use prompts::RolePrompts;
pub use types::{
    AdversarialResult, BlueRecommendation, BlueTeamAssessment, JudgeRuling, RedTeamAssessment,
    Verdict,
};

const EXPLOIT_GUEST_PATH: &str = "/workspace/exploit.ts";
const EXPLOIT_TIMEOUT: Duration = Duration::from_secs(25);
const MAX_SOURCE_CHARS: usize = 16 * 1024;
const MAX_RECORDED_STDOUT: usize = 4 * 1024;

pub struct AdversarialPipeline {
    reasoner: Option<Arc<dyn Reasoner>>,
    sandbox: Arc<SandboxSupervisor>,
    prompts: RolePrompts,
    min_confidence: u8,
    concurrency: usize,
}

impl AdversarialPipeline {
    pub fn new(
        reasoner: Option<Arc<dyn Reasoner>>,
        sandbox: Arc<SandboxSupervisor>,
        repo_root: &Path,
        config: &EngineConfig,
    ) -> Self {
        Self {
            reasoner,
            sandbox,
            prompts: RolePrompts::load(repo_root),
            min_confidence: config.min_adversarial_confidence,
            concurrency: config.adversarial_concurrency.max(1),
        }
    }

    /// Debate every eligible finding. Results come back in input order.
    pub async fn run(&self, findings: &[Finding]) -> Vec<AdversarialResult> {
        let eligible: Vec<Finding> = findings
            .iter()
            .filter(|f| f.confidence >= self.min_confidence)
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        debug!(
            eligible = eligible.len(),
            total = findings.len(),
            "adversarial pipeline starting"
        );

        let mut slots: Vec<Option<AdversarialResult>> = Vec::new();
        slots.resize_with(eligible.len(), || None);
        let mut queue = eligible.into_iter().enumerate().collect::<Vec<_>>();
        queue.reverse();
        let mut in_flight: JoinSet<(usize, AdversarialResult)> = JoinSet::new();

        loop {
            while in_flight.len() < self.concurrency {
                let Some((index, finding)) = queue.pop() else {
                    break;
                };
                let this = self.clone_handles();
                in_flight.spawn(async move { (index, this.debate(finding).await) });
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_error) => warn!(%join_error, "adversarial debate panicked"),
            }
        }

        slots.into_iter().flatten().collect()
    }

    fn clone_handles(&self) -> DebateContext {
        DebateContext {
            reasoner: self.reasoner.clone(),
            sandbox: self.sandbox.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

struct DebateContext {
    reasoner: Option<Arc<dyn Reasoner>>,
    sandbox: Arc<SandboxSupervisor>,
    prompts: RolePrompts,
}

impl DebateContext {
    /// Red, then blue, then judge; strictly in that order.
    async fn debate(&self, finding: Finding) -> AdversarialResult {
        let source = read_source(&finding);

        let mut red = self.red_team(&finding, &source).await;
        if red.exploit_code.is_some() {
            self.maybe_execute_exploit(&mut red).await;
        }
        let blue = self.blue_team(&finding, &red).await;
        let judge = self.judge(&finding, &red, &blue).await;

        AdversarialResult {
            finding,
            red_team: Some(red),
            blue_team: Some(blue),
            judge: Some(judge),
        }
    }

    async fn red_team(&self, finding: &Finding, source: &str) -> RedTeamAssessment {
        let fallback = |reason: String| RedTeamAssessment {
            exploitable: false,
            confidence: 0,
            reason: Some(reason),
            ..RedTeamAssessment::default()
        };

        let Some(reasoner) = &self.reasoner else {
            return fallback("no reasoner configured".to_string());
        };
        let request = CompletionRequest {
            system: self.prompts.red_system.clone(),
            user: format!(
                "Finding: {} [{}] at {}:{} (severity {}, confidence {})\n\n{}\n\nSource:\n{}",
                finding.title,
                finding.vuln_class,
                finding.file.display(),
                finding.line,
                finding.severity,
                finding.confidence,
                finding.description,
                source,
            ),
        };
        match reasoner.complete(request).await {
            Ok(reply) => match extract_json(&reply)
                .and_then(|v| serde_json::from_value::<RedTeamAssessment>(v).ok())
            {
                Some(mut red) => {
                    red.confidence = red.confidence.min(100);
                    // Execution evidence is only ever recorded by us.
                    red.sandbox_executed = false;
                    red.sandbox_exit_code = None;
                    red.sandbox_stdout = None;
                    red
                }
                None => fallback("red team reply was not parseable".to_string()),
            },
            Err(e) => fallback(format!("red team reasoner failed: {e}")),
        }
    }

    /// Prove the exploit in a sandbox when the runtime and image exist.
    /// Degrades to "not executed" on any failure; evidence is never forged.
    async fn maybe_execute_exploit(&self, red: &mut RedTeamAssessment) {
        let Some(code) = red.exploit_code.clone() else {
            return;
        };
        if !self.sandbox.is_runtime_available().await
            || !self.sandbox.is_image_built(SandboxProfile::Solana).await
        {
            debug!("sandbox unavailable; exploit not executed");
            return;
        }

        let session = match self
            .sandbox
            .create(SandboxProfile::Solana, SessionOverrides::default())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(%e, "sandbox create failed; exploit not executed");
                return;
            }
        };

        let run = async {
            session
                .write_file(EXPLOIT_GUEST_PATH, code.as_bytes())
                .await?;
            session
                .exec(
                    &["npx", "--yes", "tsx", EXPLOIT_GUEST_PATH],
                    Some(EXPLOIT_TIMEOUT),
                )
                .await
        };
        match run.await {
            Ok(outcome) => {
                red.sandbox_executed = true;
                red.sandbox_exit_code = Some(outcome.exit_code);
                let mut stdout = outcome.stdout;
                // Truncate on a char boundary; the cap can land mid-codepoint.
                let mut end = MAX_RECORDED_STDOUT.min(stdout.len());
                while !stdout.is_char_boundary(end) {
                    end -= 1;
                }
                stdout.truncate(end);
                red.sandbox_stdout = Some(stdout);
            }
            Err(e) => warn!(%e, "exploit execution failed; evidence not recorded"),
        }
        session.destroy().await;
    }

    async fn blue_team(&self, finding: &Finding, red: &RedTeamAssessment) -> BlueTeamAssessment {
        let Some(reasoner) = &self.reasoner else {
            return BlueTeamAssessment::default();
        };
        let red_summary = serde_json::to_string(red).unwrap_or_else(|_| "{}".to_string());
        let request = CompletionRequest {
            system: self.prompts.blue_system.clone(),
            user: format!(
                "Finding: {} [{}] at {}:{}\n\nRed team assessment:\n{}",
                finding.title,
                finding.vuln_class,
                finding.file.display(),
                finding.line,
                red_summary,
            ),
        };
        match reasoner.complete(request).await {
            Ok(reply) => extract_json(&reply)
                .and_then(|v| serde_json::from_value::<BlueTeamAssessment>(v).ok())
                .map(|mut blue| {
                    blue.overall_risk_reduction = blue.overall_risk_reduction.min(100);
                    blue
                })
                .unwrap_or_default(),
            Err(e) => {
                warn!(%e, "blue team reasoner failed; using conservative default");
                BlueTeamAssessment::default()
            }
        }
    }

    async fn judge(
        &self,
        finding: &Finding,
        red: &RedTeamAssessment,
        blue: &BlueTeamAssessment,
    ) -> JudgeRuling {
        if let Some(reasoner) = &self.reasoner {
            let request = CompletionRequest {
                system: self.prompts.judge_system.clone(),
                user: format!(
                    "Finding: {} [{}] at {}:{} (severity {}, confidence {})\n\n\
                     Red team:\n{}\n\nBlue team:\n{}",
                    finding.title,
                    finding.vuln_class,
                    finding.file.display(),
                    finding.line,
                    finding.severity,
                    finding.confidence,
                    serde_json::to_string(red).unwrap_or_else(|_| "{}".to_string()),
                    serde_json::to_string(blue).unwrap_or_else(|_| "{}".to_string()),
                ),
            };
            if let Ok(reply) = reasoner.complete(request).await
                && let Some(mut ruling) = extract_json(&reply)
                    .and_then(|v| serde_json::from_value::<JudgeRuling>(v).ok())
            {
                ruling.final_confidence = ruling.final_confidence.min(100);
                return ruling;
            }
            warn!("judge produced no parseable verdict; using inference rule");
        }
        infer_ruling(finding, red, blue)
    }
}

/// Deterministic verdict when the judge cannot rule: sandbox proof beats
/// argued exploitability beats the defender's recommendation.
fn infer_ruling(
    finding: &Finding,
    red: &RedTeamAssessment,
    blue: &BlueTeamAssessment,
) -> JudgeRuling {
    let (verdict, final_confidence, reasoning) = if red.sandbox_executed
        && red.sandbox_exit_code == Some(0)
    {
        (
            Verdict::Confirmed,
            95,
            "exploit executed successfully in the sandbox".to_string(),
        )
    } else if red.exploitable && red.confidence >= 70 {
        (
            Verdict::Likely,
            finding.confidence.max(red.confidence),
            "red team argues exploitability with high confidence".to_string(),
        )
    } else if blue.recommendation == BlueRecommendation::Mitigated {
        (
            Verdict::Disputed,
            35,
            "defender identified effective mitigations".to_string(),
        )
    } else if blue.recommendation == BlueRecommendation::Infeasible {
        (
            Verdict::FalsePositive,
            10,
            "defender assessed the attack as infeasible".to_string(),
        )
    } else {
        (
            Verdict::Likely,
            finding.confidence,
            "no decisive evidence either way".to_string(),
        )
    };

    JudgeRuling {
        verdict,
        final_severity: finding.severity,
        final_confidence,
        reasoning,
        evidence_summary: format!(
            "red: exploitable={} confidence={}; blue: recommendation={:?} risk_reduction={}",
            red.exploitable, red.confidence, blue.recommendation, blue.overall_risk_reduction
        ),
    }
}

/// Keep only confirmed/likely findings, with the judge's severity and
/// confidence substituted in.
pub fn filter_by_verdict(results: &[AdversarialResult]) -> Vec<Finding> {
    results
        .iter()
        .filter_map(|result| {
            let judge = result.judge.as_ref()?;
            if !judge.verdict.is_actionable() {
                return None;
            }
            let mut finding = result.finding.clone();
            finding.severity = judge.final_severity;
            finding.confidence = judge.final_confidence;
            Some(finding)
        })
        .collect()
}

fn read_source(finding: &Finding) -> String {
    match std::fs::read_to_string(&finding.file) {
        Ok(source) => source.chars().take(MAX_SOURCE_CHARS).collect(),
        Err(_) => String::new(),
    }
}
