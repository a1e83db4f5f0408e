//! Scan targets: what to audit and in which mode.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HydraErr, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Full,
    Diff,
}

impl ScanMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "full" => Some(ScanMode::Full),
            "diff" => Some(ScanMode::Diff),
            _ => None,
        }
    }
}

/// The change scope of a diff-mode scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSpec {
    pub base_ref: Option<String>,
    pub head_ref: Option<String>,
    /// Absolute paths of changed files under the target root.
    pub changed_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTarget {
    /// Canonicalized repository root.
    pub root: PathBuf,
    pub mode: ScanMode,
    pub diff: Option<DiffSpec>,
}

impl ScanTarget {
    /// Canonicalize and validate a root path. Rejects anything that is not an
    /// existing directory before any subprocess or walk touches it.
    pub fn resolve_root(path: &Path) -> Result<PathBuf> {
        let canonical = path.canonicalize().map_err(|e| HydraErr::InvalidTarget {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(HydraErr::InvalidTarget {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(canonical)
    }

    pub fn full(root: PathBuf) -> Self {
        Self {
            root,
            mode: ScanMode::Full,
            diff: None,
        }
    }

    pub fn diff(root: PathBuf, spec: DiffSpec) -> Self {
        Self {
            root,
            mode: ScanMode::Diff,
            diff: Some(spec),
        }
    }

    /// Changed files in diff mode; empty for full scans.
    pub fn changed_files(&self) -> &[PathBuf] {
        self.diff
            .as_ref()
            .map(|d| d.changed_files.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_root_rejects_files_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(ScanTarget::resolve_root(dir.path()).is_ok());
        assert!(ScanTarget::resolve_root(&file).is_err());
        assert!(ScanTarget::resolve_root(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn mode_parsing_is_closed() {
        assert_eq!(ScanMode::parse("full"), Some(ScanMode::Full));
        assert_eq!(ScanMode::parse("diff"), Some(ScanMode::Diff));
        assert_eq!(ScanMode::parse("incremental"), None);
    }
}
