//! Built-in scanner modules and agent-task composition.
//!
//! A scanner is the narrow pluggable contract: an id plus a pure walk of the
//! target tree into findings. The bundled detectors are heuristic and
//! marker-driven; anything smarter rides the LLM focus scanners in
//! [`llm`]. Composition for a scan is fixed: the three domain scanners and
//! the deterministic signals adapter always run, LLM tasks join when a
//! reasoner is configured.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::ScanCache;
use crate::config::EngineConfig;
use crate::dispatcher::AgentTask;
use crate::error::Result;
use crate::finding::{Finding, Severity, VulnClass};
use crate::reasoner::Reasoner;
use crate::target::ScanTarget;

pub mod account_validation;
pub mod cpi_safety;
pub mod llm;
pub mod pda_seeds;
pub mod signals;

pub use account_validation::AccountValidationScanner;
pub use cpi_safety::CpiSafetyScanner;
pub use pda_seeds::PdaSeedsScanner;
pub use signals::DeterministicSignalsScanner;

const MARKER_PREFIX: &str = "HYDRA_VULN:";
const MARKER_SEVERITY: Severity = Severity::High;
const MARKER_CONFIDENCE: u8 = 88;

const SCANNABLE_EXTS: &[&str] = &["rs", "ts", "tsx", "js", "jsx", "py", "go", "sol"];
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".idea",
    ".vscode",
    ".hydra",
    "node_modules",
    "target",
    "dist",
    "build",
    "coverage",
];

/// The detector contract: deterministic under an unchanged filesystem
/// snapshot, no side effects, errors surface as `Err` and become failed
/// agent runs in the dispatcher.
pub trait Scanner: Send + Sync {
    fn id(&self) -> &'static str;

    /// Per-file detection over already-read source text.
    fn scan_file(&self, path: &Path, source: &str) -> Vec<Finding>;

    /// Walk `root` and apply [`Scanner::scan_file`] to every source file.
    fn scan(&self, root: &Path) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        for file in walk_source_files(root) {
            let Ok(source) = std::fs::read_to_string(&file) else {
                continue;
            };
            findings.extend(self.scan_file(&file, &source));
        }
        Ok(findings)
    }
}

/// Like [`Scanner::scan`], but consulting the per-scan result cache before
/// touching each file's content.
pub fn scan_with_cache(
    scanner: &dyn Scanner,
    root: &Path,
    cache: &Mutex<ScanCache>,
) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for file in walk_source_files(root) {
        let Ok(bytes) = std::fs::read(&file) else {
            continue;
        };
        let cached = {
            let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.lookup(scanner.id(), &file, &bytes)
        };
        let file_findings = match cached {
            Some(hit) => hit,
            None => {
                let source = String::from_utf8_lossy(&bytes);
                let fresh = scanner.scan_file(&file, &source);
                let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                cache.put(scanner.id(), &file, &bytes, fresh.clone(), None);
                fresh
            }
        };
        findings.extend(file_findings);
    }
    Ok(findings)
}

/// The fixed task set for one scan: domain scanners + deterministic signals,
/// plus one LLM focus task per vulnerability focus when a reasoner exists.
pub fn build_agent_tasks(
    target: &ScanTarget,
    cache: Arc<Mutex<ScanCache>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    config: &EngineConfig,
) -> Vec<AgentTask> {
    let scanners: Vec<Arc<dyn Scanner>> = vec![
        Arc::new(AccountValidationScanner),
        Arc::new(CpiSafetyScanner),
        Arc::new(PdaSeedsScanner),
        Arc::new(DeterministicSignalsScanner),
    ];

    let mut tasks = Vec::new();
    for scanner in scanners {
        let root = target.root.clone();
        let cache = cache.clone();
        let agent_id = scanner.id();
        tasks.push(
            AgentTask::new(agent_id, async move {
                tokio::task::spawn_blocking(move || scan_with_cache(scanner.as_ref(), &root, &cache))
                    .await
                    .map_err(|e| crate::error::HydraErr::Fatal(e.to_string()))?
            })
            .with_timeout(config.agent_timeout),
        );
    }

    if let Some(reasoner) = reasoner {
        for focus in llm::VulnFocus::ALL {
            let task = llm::LlmScanner::new(*focus, reasoner.clone())
                .into_task(target.root.clone(), config.llm_agent_timeout);
            tasks.push(task);
        }
    }

    tasks
}

/// Bounded, ignore-aware walk shared by the file scanners. Ordering is
/// deterministic (sorted) so scanner output is too.
pub(crate) fn walk_source_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    walk_into(root, &mut files);
    files.sort();
    files
}

fn walk_into(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let name = entry.file_name();
            if IGNORED_DIRS.contains(&name.to_string_lossy().as_ref()) {
                continue;
            }
            walk_into(&path, out);
        } else if file_type.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SCANNABLE_EXTS.contains(&ext))
        {
            out.push(path);
        }
    }
}

/// Findings for explicit `HYDRA_VULN:<class>` markers belonging to this
/// scanner's class partition. Benchmark trees carry these markers; each
/// class is claimed by exactly one scanner so a marker never self-corroborates.
pub(crate) fn marker_findings(
    scanner_id: &'static str,
    classes: &[VulnClass],
    path: &Path,
    source: &str,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        let Some(at) = line.find(MARKER_PREFIX) else {
            continue;
        };
        let tag: String = line[at + MARKER_PREFIX.len()..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let Some(class) = VulnClass::parse_tag(&tag) else {
            continue;
        };
        if !classes.contains(&class) {
            continue;
        }
        findings.push(Finding::new(
            scanner_id,
            class,
            MARKER_SEVERITY,
            MARKER_CONFIDENCE,
            path.to_path_buf(),
            idx + 1,
            format!("explicit {tag} marker"),
            format!("source is annotated with a {tag} vulnerability marker"),
            line.trim().to_string(),
        ));
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn marker_detection_respects_class_partition() {
        let source = "fn f() {}\n// HYDRA_VULN:missing_signer_check\n// HYDRA_VULN:arbitrary_cpi\n";
        let found = marker_findings(
            "account_validation",
            &[VulnClass::MissingSignerCheck],
            Path::new("/r/lib.rs"),
            source,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::MissingSignerCheck);
        assert_eq!(found[0].line, 2);
        assert_eq!(found[0].severity, Severity::High);
        assert_eq!(found[0].confidence, 88);
    }

    #[test]
    fn unknown_marker_tags_are_ignored() {
        let source = "// HYDRA_VULN:not_a_real_class\n";
        let found = marker_findings(
            "account_validation",
            &[VulnClass::MissingSignerCheck],
            Path::new("/r/lib.rs"),
            source,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn walk_skips_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("node_modules/dep/index.js"), "x\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs\n").unwrap();

        let files = walk_source_files(dir.path());
        assert_eq!(files, vec![dir.path().join("src/lib.rs")]);
    }
}
