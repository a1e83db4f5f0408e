//! Thin wrapper over the `git` binary.
//!
//! The engine must keep working on trees that are not repositories and on
//! hosts without git installed, so every helper here is missing-safe: a
//! failed or absent git yields `None`/empty rather than an error. Scope
//! resolution degrades to an empty changed set, which the orchestrator turns
//! into a completed scan with zero findings.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

/// Repository state folded into the threat-model fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitContext {
    pub commit: Option<String>,
    pub tree: Option<String>,
    pub dirty: bool,
}

/// Collect commit, tree, and dirty state for `root`. Absent git (or a
/// non-repository) yields the default context.
pub async fn collect_context(root: &Path) -> GitContext {
    let commit = run_git(root, &["rev-parse", "HEAD"]).await;
    let tree = run_git(root, &["rev-parse", "HEAD^{tree}"]).await;
    let dirty = run_git(root, &["status", "--porcelain"])
        .await
        .map(|out| !out.is_empty())
        .unwrap_or(false);
    GitContext { commit, tree, dirty }
}

/// Resolve the changed-file scope between two refs, unioned with untracked
/// working-tree files. `head` defaults to `HEAD`. Paths are returned
/// absolute, restricted to files that still exist under `root`.
pub async fn resolve_changed_files(
    root: &Path,
    base: &str,
    head: Option<&str>,
) -> Vec<PathBuf> {
    let range = format!("{base}..{}", head.unwrap_or("HEAD"));
    let mut relative: BTreeSet<String> = BTreeSet::new();

    match run_git(
        root,
        &["diff", "--name-only", "--diff-filter=ACMR", &range],
    )
    .await
    {
        Some(out) => relative.extend(out.lines().map(str::to_string)),
        None => {
            debug!("git diff failed for {range}; treating scope as empty");
            return Vec::new();
        }
    }

    if let Some(out) = run_git(root, &["ls-files", "--others", "--exclude-standard"]).await {
        relative.extend(out.lines().map(str::to_string));
    }

    relative
        .into_iter()
        .filter(|rel| !rel.is_empty())
        .map(|rel| root.join(rel))
        .filter(|abs| abs.is_file())
        .collect()
}

/// Run git with `args`, returning trimmed stdout on success.
async fn run_git(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_repository_yields_default_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = collect_context(dir.path()).await;
        assert_eq!(ctx, GitContext::default());
    }

    #[tokio::test]
    async fn failed_diff_degrades_to_empty_scope() {
        let dir = tempfile::tempdir().unwrap();
        let changed = resolve_changed_files(dir.path(), "HEAD~1", Some("HEAD")).await;
        assert!(changed.is_empty());
    }
}
