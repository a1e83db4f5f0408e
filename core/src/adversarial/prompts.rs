//! Role prompts for the debate, with per-repository overrides.
//!
//! A repository can pin alternative system prompts under
//! `.hydra/prompt-variants/<role>.json`; absent or unreadable variants fall
//! back to the built-ins.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

pub const RED_SYSTEM: &str = "You are a red-team security researcher. Given a vulnerability \
finding and the surrounding source, argue exploitability. Reply with a JSON object: \
{\"exploitable\": bool, \"exploit_code\": string|null, \"attack_steps\": [string], \
\"economic_impact\": string|null, \"confidence\": 0-100, \"reason\": string}. \
exploit_code, when present, must be a self-contained TypeScript proof of concept.";

pub const BLUE_SYSTEM: &str = "You are a blue-team defender. Given a vulnerability finding \
and the red team's assessment, argue mitigation and reachability. Reply with a JSON \
object: {\"existing_mitigations\": [string], \"reachable\": bool, \
\"reachability_reasoning\": string, \"env_protections\": [string], \
\"economically_feasible\": bool, \"overall_risk_reduction\": 0-100, \
\"recommendation\": \"confirmed\"|\"mitigated\"|\"infeasible\"}.";

pub const JUDGE_SYSTEM: &str = "You are an impartial judge arbitrating between a red-team \
and a blue-team assessment of one vulnerability finding. Reply with a JSON object: \
{\"verdict\": \"confirmed\"|\"likely\"|\"disputed\"|\"false_positive\", \
\"final_severity\": \"critical\"|\"high\"|\"medium\"|\"low\", \
\"final_confidence\": 0-100, \"reasoning\": string, \"evidence_summary\": string}.";

#[derive(Debug, Clone, Default)]
pub struct RolePrompts {
    pub red_system: String,
    pub blue_system: String,
    pub judge_system: String,
}

#[derive(Debug, Deserialize)]
struct PromptVariant {
    system: String,
}

impl RolePrompts {
    /// Built-ins overlaid with any variants stored under `repo_root`.
    pub fn load(repo_root: &Path) -> Self {
        let dir = repo_root.join(".hydra").join("prompt-variants");
        Self {
            red_system: load_variant(&dir, "red_team").unwrap_or_else(|| RED_SYSTEM.to_string()),
            blue_system: load_variant(&dir, "blue_team").unwrap_or_else(|| BLUE_SYSTEM.to_string()),
            judge_system: load_variant(&dir, "judge").unwrap_or_else(|| JUDGE_SYSTEM.to_string()),
        }
    }
}

fn load_variant(dir: &Path, role: &str) -> Option<String> {
    let path = dir.join(format!("{role}.json"));
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<PromptVariant>(&raw) {
        Ok(variant) => Some(variant.system),
        Err(e) => {
            warn!(role, %e, "ignoring malformed prompt variant");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_apply_without_variants() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = RolePrompts::load(dir.path());
        assert_eq!(prompts.red_system, RED_SYSTEM);
        assert_eq!(prompts.judge_system, JUDGE_SYSTEM);
    }

    #[test]
    fn variant_overrides_one_role_only() {
        let dir = tempfile::tempdir().unwrap();
        let variants = dir.path().join(".hydra").join("prompt-variants");
        std::fs::create_dir_all(&variants).unwrap();
        std::fs::write(
            variants.join("red_team.json"),
            r#"{"system": "be extra persistent"}"#,
        )
        .unwrap();
        std::fs::write(variants.join("judge.json"), "{broken").unwrap();

        let prompts = RolePrompts::load(dir.path());
        assert_eq!(prompts.red_system, "be extra persistent");
        assert_eq!(prompts.blue_system, BLUE_SYSTEM);
        assert_eq!(prompts.judge_system, JUDGE_SYSTEM);
    }
}
