//! Versioned threat-model snapshots.
//!
//! A snapshot summarizes a repository's attack surface at a point in time and
//! is keyed by a fingerprint of the scan scope plus git state. Identical
//! fingerprints reuse the stored version; anything else appends a new version
//! with a strictly increasing revision. History is never rewritten.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{HydraErr, Result};
use crate::git::{self, GitContext};
use crate::target::{ScanMode, ScanTarget};

const SCHEMA_VERSION: u32 = 1;
const MAX_SOURCE_FILES: usize = 2_000;
const MAX_SCOPE_FILES: usize = 50;
const MAX_ENTRY_POINTS: usize = 24;

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

const SOURCE_EXTS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "sol", "java", "c", "cc", "cpp", "h", "rb", "php",
];

const ENTRY_FILENAMES: &[&str] = &[
    "main.rs", "lib.rs", "index.ts", "index.js", "app.py", "main.py", "main.go", "server.ts",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatModelSummary {
    pub primary_language: String,
    pub language_breakdown: BTreeMap<String, usize>,
    pub detected_frameworks: Vec<String>,
    pub assets: Vec<String>,
    pub trust_boundaries: Vec<String>,
    pub entry_points: Vec<String>,
    pub attack_surface: Vec<String>,
    pub scan_scope_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatModelVersion {
    pub version_id: String,
    pub repo_id: String,
    /// Monotonic per repository.
    pub revision: u64,
    pub parent_version_id: Option<String>,
    pub schema_version: u32,
    pub fingerprint: String,
    pub summary: ThreatModelSummary,
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ThreatModelOutcome {
    pub version: ThreatModelVersion,
    pub loaded_from_cache: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VersionsFile {
    schema_version: u32,
    repo_id: String,
    latest_version_id: Option<String>,
    /// fingerprint -> version_id. Newest fingerprint wins on collision.
    by_fingerprint: BTreeMap<String, String>,
    versions: Vec<ThreatModelVersion>,
}

/// Append-only store under `<root>/.hydra/threat-models/<repo_id>/versions.json`.
#[derive(Debug)]
pub struct ThreatModelStore {
    base_dir: PathBuf,
}

impl ThreatModelStore {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            base_dir: repo_root.join(".hydra").join("threat-models"),
        }
    }

    pub fn repo_id(root: &Path) -> String {
        hex::encode(&Sha256::digest(root.to_string_lossy().as_bytes())[..6])
    }

    /// Return the cached version whose fingerprint matches the target's
    /// current state, or synthesize and append a new one.
    pub async fn load_or_create(&self, target: &ScanTarget) -> Result<ThreatModelOutcome> {
        let repo_id = Self::repo_id(&target.root);
        let git_context = git::collect_context(&target.root).await;
        let fingerprint = compute_fingerprint(target, &git_context);

        let versions_path = self.versions_path(&repo_id);
        let mut file = self.load_versions(&versions_path, &repo_id);

        if let Some(version_id) = file.by_fingerprint.get(&fingerprint)
            && let Some(version) = file.versions.iter().find(|v| &v.version_id == version_id)
        {
            debug!(%repo_id, %fingerprint, "threat model fingerprint hit");
            return Ok(ThreatModelOutcome {
                version: version.clone(),
                loaded_from_cache: true,
            });
        }

        let parent = file
            .latest_version_id
            .as_ref()
            .and_then(|id| file.versions.iter().find(|v| &v.version_id == id));
        let revision = parent.map(|p| p.revision + 1).unwrap_or(1);
        let parent_version_id = parent.map(|p| p.version_id.clone());

        let summary = build_summary(target);
        let version_id = {
            let mut hasher = Sha256::new();
            hasher.update(repo_id.as_bytes());
            hasher.update(b"|");
            hasher.update(fingerprint.as_bytes());
            hasher.update(b"|");
            hasher.update(revision.to_string().as_bytes());
            hex::encode(&hasher.finalize()[..6])
        };

        let version = ThreatModelVersion {
            version_id: version_id.clone(),
            repo_id: repo_id.clone(),
            revision,
            parent_version_id,
            schema_version: SCHEMA_VERSION,
            fingerprint: fingerprint.clone(),
            summary,
            storage_path: versions_path.clone(),
            created_at: Utc::now(),
        };

        file.by_fingerprint.insert(fingerprint, version_id.clone());
        file.latest_version_id = Some(version_id);
        file.versions.push(version.clone());
        self.persist(&versions_path, &file)?;

        Ok(ThreatModelOutcome {
            version,
            loaded_from_cache: false,
        })
    }

    fn versions_path(&self, repo_id: &str) -> PathBuf {
        self.base_dir.join(repo_id).join("versions.json")
    }

    fn load_versions(&self, path: &Path, repo_id: &str) -> VersionsFile {
        let empty = || VersionsFile {
            schema_version: SCHEMA_VERSION,
            repo_id: repo_id.to_string(),
            ..VersionsFile::default()
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<VersionsFile>(&raw) {
                Ok(file) if file.schema_version == SCHEMA_VERSION => file,
                Ok(_) | Err(_) => {
                    warn!("threat model store unreadable or mismatched; starting empty");
                    empty()
                }
            },
            Err(_) => empty(),
        }
    }

    fn persist(&self, path: &Path, file: &VersionsFile) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| HydraErr::Fatal("versions path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;
        let raw = serde_json::to_vec_pretty(file)
            .map_err(|e| HydraErr::json_parse("threat model serialization", e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&raw)?;
        tmp.persist(path).map_err(|e| HydraErr::Io(e.error))?;
        Ok(())
    }
}

/// Digest of everything that defines "the same repository state for the same
/// scope". Missing git fields hash as empty strings so the fingerprint stays
/// stable for an unchanged tree without git.
fn compute_fingerprint(target: &ScanTarget, git_context: &GitContext) -> String {
    let (base_ref, head_ref) = target
        .diff
        .as_ref()
        .map(|d| (d.base_ref.clone(), d.head_ref.clone()))
        .unwrap_or_default();

    let mut relative: Vec<String> = target
        .changed_files()
        .iter()
        .map(|abs| {
            abs.strip_prefix(&target.root)
                .unwrap_or(abs)
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    relative.sort();
    let files_digest = hex::encode(Sha256::digest(relative.join("\n").as_bytes()));

    let mode = match target.mode {
        ScanMode::Full => "full",
        ScanMode::Diff => "diff",
    };
    let mut hasher = Sha256::new();
    for part in [
        mode,
        git_context.commit.as_deref().unwrap_or(""),
        git_context.tree.as_deref().unwrap_or(""),
        if git_context.dirty { "dirty" } else { "clean" },
        base_ref.as_deref().unwrap_or(""),
        head_ref.as_deref().unwrap_or(""),
        &files_digest,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Bounded walk of the source tree feeding the summary heuristics. Pure with
/// respect to the filesystem contents at generation time.
fn build_summary(target: &ScanTarget) -> ThreatModelSummary {
    let mut source_files = Vec::new();
    collect_source_files(&target.root, &mut source_files);
    source_files.sort();
    source_files.truncate(MAX_SOURCE_FILES);

    let mut language_breakdown: BTreeMap<String, usize> = BTreeMap::new();
    for file in &source_files {
        if let Some(ext) = file.extension().and_then(|e| e.to_str()) {
            *language_breakdown.entry(ext.to_string()).or_default() += 1;
        }
    }
    let primary_language = language_breakdown
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(ext, _)| ext.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let detected_frameworks = detect_frameworks(&target.root, &language_breakdown);
    let entry_points = collect_entry_points(&source_files);

    let mut assets = vec!["source_code".to_string()];
    let mut trust_boundaries = Vec::new();
    let mut attack_surface = Vec::new();
    if detected_frameworks.iter().any(|f| f == "anchor") {
        assets.extend([
            "lamport_balances".to_string(),
            "spl_token_accounts".to_string(),
            "program_authority".to_string(),
        ]);
        trust_boundaries.extend([
            "instruction_dispatch".to_string(),
            "cross_program_invocation".to_string(),
            "account_deserialization".to_string(),
        ]);
        attack_surface.push("on_chain_instructions".to_string());
    }
    if detected_frameworks.iter().any(|f| f == "node" || f == "axum") {
        trust_boundaries.push("http_ingress".to_string());
        attack_surface.push("http_endpoints".to_string());
    }
    if attack_surface.is_empty() {
        attack_surface.push("local_invocation".to_string());
    }

    let scan_scope_files = if target.mode == ScanMode::Diff {
        target.changed_files().to_vec()
    } else {
        source_files.iter().take(MAX_SCOPE_FILES).cloned().collect()
    };

    ThreatModelSummary {
        primary_language,
        language_breakdown,
        detected_frameworks,
        assets,
        trust_boundaries,
        entry_points,
        attack_surface,
        scan_scope_files,
    }
}

fn collect_source_files(dir: &Path, out: &mut Vec<PathBuf>) {
    if out.len() >= MAX_SOURCE_FILES {
        return;
    }
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
            let name = name.to_string_lossy();
            if IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_source_files(&path, out);
        } else if file_type.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SOURCE_EXTS.contains(&ext))
        {
            out.push(path);
            if out.len() >= MAX_SOURCE_FILES {
                return;
            }
        }
    }
}

fn detect_frameworks(root: &Path, breakdown: &BTreeMap<String, usize>) -> Vec<String> {
    let mut frameworks = Vec::new();
    if root.join("Anchor.toml").is_file() {
        frameworks.push("anchor".to_string());
    }
    if root.join("Cargo.toml").is_file() {
        frameworks.push("cargo".to_string());
    }
    if root.join("package.json").is_file() {
        frameworks.push("node".to_string());
    }
    // A tree of Rust sources that mentions anchor_lang is an Anchor program
    // even without the manifest (fixtures, vendored program crates).
    if !frameworks.iter().any(|f| f == "anchor") && breakdown.contains_key("rs") {
        let lib = root.join("src").join("lib.rs");
        if let Ok(contents) = std::fs::read_to_string(lib)
            && contents.contains("anchor_lang")
        {
            frameworks.push("anchor".to_string());
        }
    }
    frameworks
}

fn collect_entry_points(source_files: &[PathBuf]) -> Vec<String> {
    let mut entry_points = Vec::new();
    for file in source_files {
        if entry_points.len() >= MAX_ENTRY_POINTS {
            return entry_points;
        }
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if ENTRY_FILENAMES.contains(&name) {
            entry_points.push(name.to_string());
        }
    }
    // Public Rust functions are the callable surface of a library tree.
    for file in source_files {
        if entry_points.len() >= MAX_ENTRY_POINTS {
            break;
        }
        if file.extension().and_then(|e| e.to_str()) != Some("rs") {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(file) else {
            continue;
        };
        for line in contents.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("pub fn ")
                && let Some(fn_name) = rest.split(['(', '<']).next()
            {
                let fn_name = fn_name.trim().to_string();
                if !fn_name.is_empty() && !entry_points.contains(&fn_name) {
                    entry_points.push(fn_name);
                    if entry_points.len() >= MAX_ENTRY_POINTS {
                        break;
                    }
                }
            }
        }
    }
    entry_points
}
