//! Typed outcomes of the red/blue/judge debate.

use serde::{Deserialize, Serialize};

use crate::finding::{Finding, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedTeamAssessment {
    pub exploitable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploit_code: Option<String>,
    #[serde(default)]
    pub attack_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub economic_impact: Option<String>,
    #[serde(default)]
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub sandbox_executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_stdout: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueRecommendation {
    Confirmed,
    Mitigated,
    Infeasible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueTeamAssessment {
    #[serde(default)]
    pub existing_mitigations: Vec<String>,
    pub reachable: bool,
    #[serde(default)]
    pub reachability_reasoning: String,
    #[serde(default)]
    pub env_protections: Vec<String>,
    pub economically_feasible: bool,
    /// 0..=100.
    #[serde(default)]
    pub overall_risk_reduction: u8,
    pub recommendation: BlueRecommendation,
}

impl Default for BlueTeamAssessment {
    fn default() -> Self {
        // The conservative stance: assume the attack is live until a real
        // assessment says otherwise.
        Self {
            existing_mitigations: Vec::new(),
            reachable: true,
            reachability_reasoning: String::new(),
            env_protections: Vec::new(),
            economically_feasible: true,
            overall_risk_reduction: 0,
            recommendation: BlueRecommendation::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Confirmed,
    Likely,
    Disputed,
    FalsePositive,
}

impl Verdict {
    /// Verdicts that keep a finding alive downstream.
    pub fn is_actionable(self) -> bool {
        matches!(self, Verdict::Confirmed | Verdict::Likely)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRuling {
    pub verdict: Verdict,
    pub final_severity: Severity,
    /// 0..=100.
    pub final_confidence: u8,
    pub reasoning: String,
    #[serde(default)]
    pub evidence_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdversarialResult {
    pub finding: Finding,
    pub red_team: Option<RedTeamAssessment>,
    pub blue_team: Option<BlueTeamAssessment>,
    pub judge: Option<JudgeRuling>,
}
