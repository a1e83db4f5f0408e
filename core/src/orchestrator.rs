//! The scan orchestrator: scope resolution, stage driving, result assembly.
//!
//! Full and diff scans differ only in how the scope is acquired. Stages run
//! in a fixed order — threat model, dispatch, aggregate, adversarial, patch —
//! and each stage's wall time is recorded. A diff scan with an empty change
//! set short-circuits to an empty result that still carries a threat model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adversarial::{AdversarialPipeline, AdversarialResult};
use crate::aggregator::aggregate;
use crate::cache::ScanCache;
use crate::config::EngineConfig;
use crate::dispatcher::{AgentRun, Dispatcher};
use crate::error::{HydraErr, Result};
use crate::finding::Finding;
use crate::git;
use crate::patch::{PatchPipeline, PatchResult};
use crate::reasoner::Reasoner;
use crate::sandbox::SandboxSupervisor;
use crate::scanners::build_agent_tasks;
use crate::target::{DiffSpec, ScanTarget};
use crate::threat_model::{ThreatModelStore, ThreatModelVersion};

/// Optional second- and third-stage toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub adversarial: bool,
    pub patch: bool,
}

/// Scope inputs for a diff scan.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
    /// Explicit change set; when present, git is not consulted.
    pub changed_files: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanReport {
    pub target: ScanTarget,
    pub threat_model: ThreatModelVersion,
    pub threat_model_from_cache: bool,
    pub agent_runs: Vec<AgentRun>,
    pub findings: Vec<Finding>,
    pub adversarial: Vec<AdversarialResult>,
    pub patches: Vec<PatchResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub stage_timings: Vec<StageTiming>,
}

pub struct ScanOrchestrator {
    config: EngineConfig,
    reasoner: Option<Arc<dyn Reasoner>>,
    sandbox: Arc<SandboxSupervisor>,
    cancel: CancellationToken,
}

impl ScanOrchestrator {
    pub fn new(
        config: EngineConfig,
        reasoner: Option<Arc<dyn Reasoner>>,
        sandbox: Arc<SandboxSupervisor>,
    ) -> Self {
        Self {
            config,
            reasoner,
            sandbox,
            cancel: CancellationToken::new(),
        }
    }

    /// Token honored by the dispatcher: cancelling stops new agent tasks
    /// while in-flight ones settle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run_full_scan(&self, root: &Path, options: ScanOptions) -> Result<ScanReport> {
        let root = ScanTarget::resolve_root(root)?;
        let target = ScanTarget::full(root);
        self.run_pipeline(target, options).await
    }

    pub async fn run_diff_scan(
        &self,
        root: &Path,
        diff: DiffOptions,
        options: ScanOptions,
    ) -> Result<ScanReport> {
        if diff.head_ref.is_some() && diff.base_ref.is_none() {
            return Err(HydraErr::HeadRefWithoutBaseRef);
        }
        let root = ScanTarget::resolve_root(root)?;

        let changed_files = match &diff.changed_files {
            Some(explicit) => normalize_changed_files(&root, explicit),
            None => match &diff.base_ref {
                Some(base) => {
                    git::resolve_changed_files(&root, base, diff.head_ref.as_deref()).await
                }
                None => Vec::new(),
            },
        };

        let target = ScanTarget::diff(
            root,
            DiffSpec {
                base_ref: diff.base_ref,
                head_ref: diff.head_ref,
                changed_files,
            },
        );
        self.run_pipeline(target, options).await
    }

    async fn run_pipeline(&self, target: ScanTarget, options: ScanOptions) -> Result<ScanReport> {
        let mut stage_timings = Vec::new();

        let stage_started = tokio::time::Instant::now();
        let store = ThreatModelStore::new(&target.root);
        let threat_model = store.load_or_create(&target).await?;
        stage_timings.push(StageTiming {
            stage: "threat_model".to_string(),
            duration_ms: stage_started.elapsed().as_millis() as u64,
        });

        let started_at = Utc::now();

        // A diff scan with nothing changed still yields a well-formed report.
        let diff_scope_empty =
            target.diff.is_some() && target.changed_files().is_empty();
        if diff_scope_empty {
            info!("diff scope is empty; skipping scan stages");
            return Ok(ScanReport {
                target,
                threat_model: threat_model.version,
                threat_model_from_cache: threat_model.loaded_from_cache,
                agent_runs: Vec::new(),
                findings: Vec::new(),
                adversarial: Vec::new(),
                patches: Vec::new(),
                started_at,
                completed_at: Utc::now(),
                stage_timings,
            });
        }

        let stage_started = tokio::time::Instant::now();
        let cache = Arc::new(Mutex::new(ScanCache::open_with(
            &target.root,
            self.config.cache_ttl,
            5_000,
        )));
        let tasks = build_agent_tasks(&target, cache.clone(), self.reasoner.clone(), &self.config);
        let dispatcher = Dispatcher::new(
            self.config.max_concurrent_agents,
            self.config.agent_timeout,
        );
        let outcome = dispatcher.run(tasks, &self.cancel).await;
        stage_timings.push(StageTiming {
            stage: "dispatch".to_string(),
            duration_ms: stage_started.elapsed().as_millis() as u64,
        });

        let stage_started = tokio::time::Instant::now();
        let mut findings = aggregate(
            outcome.findings,
            self.config.min_uncorroborated_confidence,
        );
        if target.diff.is_some() {
            let scope: Vec<&PathBuf> = target.changed_files().iter().collect();
            findings.retain(|finding| scope.iter().any(|path| **path == finding.file));
        }
        stage_timings.push(StageTiming {
            stage: "aggregate".to_string(),
            duration_ms: stage_started.elapsed().as_millis() as u64,
        });

        let adversarial = if options.adversarial {
            let stage_started = tokio::time::Instant::now();
            let pipeline = AdversarialPipeline::new(
                self.reasoner.clone(),
                self.sandbox.clone(),
                &target.root,
                &self.config,
            );
            let results = pipeline.run(&findings).await;
            stage_timings.push(StageTiming {
                stage: "adversarial".to_string(),
                duration_ms: stage_started.elapsed().as_millis() as u64,
            });
            results
        } else {
            Vec::new()
        };

        let patches = if options.patch && !adversarial.is_empty() {
            let stage_started = tokio::time::Instant::now();
            let pipeline =
                PatchPipeline::new(self.reasoner.clone(), self.sandbox.clone(), &self.config);
            let results = pipeline.run(&adversarial).await;
            stage_timings.push(StageTiming {
                stage: "patch".to_string(),
                duration_ms: stage_started.elapsed().as_millis() as u64,
            });
            results
        } else {
            Vec::new()
        };

        let completed_at = Utc::now();

        if let Err(e) = cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
        {
            // The cache is an accelerator; the next run rebuilds it.
            warn!(%e, "scan cache flush failed");
        }

        info!(
            findings = findings.len(),
            agent_runs = outcome.agent_runs.len(),
            "scan completed"
        );
        Ok(ScanReport {
            target,
            threat_model: threat_model.version,
            threat_model_from_cache: threat_model.loaded_from_cache,
            agent_runs: outcome.agent_runs,
            findings,
            adversarial,
            patches,
            started_at,
            completed_at,
            stage_timings,
        })
    }
}

/// Normalize an explicit change list to existing absolute files under root.
fn normalize_changed_files(root: &Path, raw: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = raw
        .iter()
        .map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            }
        })
        .filter(|path| path.starts_with(root) && path.is_file())
        .collect();
    files.sort();
    files.dedup();
    files
}
