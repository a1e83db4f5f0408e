//! Engine configuration.
//!
//! Precedence: built-in defaults < `.hydra/config.json` < environment.
//! Every numeric knob is validated at load; a malformed value is an error at
//! startup rather than a silent fallback mid-scan.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HydraErr, Result};

pub const ENV_MAX_CONCURRENT_AGENTS: &str = "HYDRA_MAX_CONCURRENT_AGENTS";
pub const ENV_AGENT_TIMEOUT_MS: &str = "HYDRA_AGENT_TIMEOUT_MS";

const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;
const DEFAULT_AGENT_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_LLM_AGENT_TIMEOUT_MS: u64 = 300_000;

/// Knobs consumed by the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on simultaneously running agent tasks.
    pub max_concurrent_agents: usize,
    /// Deadline for a deterministic agent task.
    pub agent_timeout: Duration,
    /// Deadline for an LLM-backed agent task.
    pub llm_agent_timeout: Duration,
    /// Aggregator gate for findings seen by a single scanner.
    pub min_uncorroborated_confidence: u8,
    /// Eligibility gate for the adversarial pipeline.
    pub min_adversarial_confidence: u8,
    /// Simultaneous adversarial debates.
    pub adversarial_concurrency: usize,
    /// Simultaneous patch generations.
    pub patch_concurrency: usize,
    /// Scan-cache entry lifetime.
    pub cache_ttl: Duration,
    /// Accept LLM-approved patches without the verifying review gate.
    pub skip_patch_review: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            agent_timeout: Duration::from_millis(DEFAULT_AGENT_TIMEOUT_MS),
            llm_agent_timeout: Duration::from_millis(DEFAULT_LLM_AGENT_TIMEOUT_MS),
            min_uncorroborated_confidence: 80,
            min_adversarial_confidence: 50,
            adversarial_concurrency: 2,
            patch_concurrency: 2,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            skip_patch_review: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the config file (if present) and environment.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let mut config = Self::default();
        if let Some(file) = ConfigFile::load(repo_root)? {
            config.apply_file(&file);
        }
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults plus environment only; used where no repo root exists yet.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(n) = file.max_concurrent_agents {
            self.max_concurrent_agents = n.max(1);
        }
        if let Some(ms) = file.agent_timeout_ms {
            self.agent_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = file.min_uncorroborated_confidence {
            self.min_uncorroborated_confidence = n.min(100);
        }
        if let Some(n) = file.min_adversarial_confidence {
            self.min_adversarial_confidence = n.min(100);
        }
        if let Some(n) = file.adversarial_concurrency {
            self.adversarial_concurrency = n.max(1);
        }
        if let Some(n) = file.patch_concurrency {
            self.patch_concurrency = n.max(1);
        }
        if let Some(b) = file.skip_patch_review {
            self.skip_patch_review = b;
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(n) = positive_usize_env(ENV_MAX_CONCURRENT_AGENTS)? {
            self.max_concurrent_agents = n;
        }
        if let Some(ms) = positive_u64_env(ENV_AGENT_TIMEOUT_MS)? {
            self.agent_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }
}

fn positive_u64_env(name: &str) -> Result<Option<u64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(HydraErr::InvalidConfig {
            name: name.to_string(),
            value: raw,
        }),
    }
}

fn positive_usize_env(name: &str) -> Result<Option<usize>> {
    Ok(positive_u64_env(name)?.map(|v| v as usize))
}

/// On-disk configuration, `.hydra/config.json` under the audited repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_agents: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_uncorroborated_confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_adversarial_confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adversarial_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_patch_review: Option<bool>,
}

impl ConfigFile {
    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(".hydra").join("config.json")
    }

    pub fn load(repo_root: &Path) -> Result<Option<Self>> {
        let path = Self::path(repo_root);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let file = serde_json::from_str(&raw)
            .map_err(|e| HydraErr::json_parse(&format!("config file {}", path.display()), e))?;
        Ok(Some(file))
    }

    pub fn save(&self, repo_root: &Path) -> Result<()> {
        let path = Self::path(repo_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| HydraErr::json_parse("config file serialization", e))?;
        std::fs::write(&path, raw)?;
        Ok(())
    }

    /// Apply a `KEY=VALUE` assignment from the CLI.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = || HydraErr::InvalidConfig {
            name: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "max_concurrent_agents" => {
                self.max_concurrent_agents =
                    Some(value.parse().ok().filter(|n| *n > 0usize).ok_or_else(invalid)?)
            }
            "agent_timeout_ms" => {
                self.agent_timeout_ms =
                    Some(value.parse().ok().filter(|n| *n > 0u64).ok_or_else(invalid)?)
            }
            "min_uncorroborated_confidence" => {
                self.min_uncorroborated_confidence =
                    Some(value.parse().ok().filter(|n| *n <= 100u8).ok_or_else(invalid)?)
            }
            "min_adversarial_confidence" => {
                self.min_adversarial_confidence =
                    Some(value.parse().ok().filter(|n| *n <= 100u8).ok_or_else(invalid)?)
            }
            "adversarial_concurrency" => {
                self.adversarial_concurrency =
                    Some(value.parse().ok().filter(|n| *n > 0usize).ok_or_else(invalid)?)
            }
            "patch_concurrency" => {
                self.patch_concurrency =
                    Some(value.parse().ok().filter(|n| *n > 0usize).ok_or_else(invalid)?)
            }
            "skip_patch_review" => self.skip_patch_review = Some(value.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        }
        Ok(())
    }
}
