//! Content-addressed scan cache.
//!
//! Keyed by `(scanner, file path, file content)` so that renaming a file or
//! editing its contents both invalidate independently. The path component is
//! hashed into the key to keep findings (which carry absolute paths) from
//! cross-contaminating between identical files at different locations.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{HydraErr, Result};
use crate::finding::Finding;

const SCHEMA_VERSION: u32 = 1;
const MAX_ENTRIES: usize = 5_000;
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub scanner_id: String,
    pub file_path: PathBuf,
    pub content_hash: String,
    pub findings: Vec<Finding>,
    pub cached_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.cached_at);
        age.num_milliseconds() < 0 || age.num_milliseconds() as u64 >= self.ttl_ms
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    schema_version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// Per-scan cache of scanner results, persisted as one JSON document under
/// `.hydra/scan-cache/`. A scan owns its instance exclusively; the single
/// atomic rewrite happens in [`ScanCache::flush`].
#[derive(Debug)]
pub struct ScanCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
    stats: CacheStats,
    ttl: Duration,
    max_entries: usize,
    dirty: bool,
}

impl ScanCache {
    /// Open the cache for `repo_root`, loading prior entries when the schema
    /// matches. A version mismatch or unreadable file yields an empty store.
    pub fn open(repo_root: &Path) -> Self {
        Self::open_with(repo_root, DEFAULT_TTL, MAX_ENTRIES)
    }

    pub fn open_with(repo_root: &Path, ttl: Duration, max_entries: usize) -> Self {
        let path = repo_root.join(".hydra").join("scan-cache").join("cache.json");
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CacheFile>(&raw) {
                Ok(file) if file.schema_version == SCHEMA_VERSION => file.entries,
                Ok(file) => {
                    warn!(
                        found = file.schema_version,
                        expected = SCHEMA_VERSION,
                        "scan cache schema mismatch; starting empty"
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!("scan cache unreadable ({e}); starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries,
            stats: CacheStats::default(),
            ttl,
            max_entries,
            dirty: false,
        }
    }

    fn key(scanner_id: &str, file_path: &Path, content_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file_path.to_string_lossy().as_bytes());
        let path_hash = hex::encode(&hasher.finalize()[..6]);
        format!("{scanner_id}:{path_hash}:{content_hash}")
    }

    fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Cached findings for this scanner/file/content, or a miss on absence or
    /// expiry. Expired entries are dropped and counted as evictions.
    pub fn lookup(
        &mut self,
        scanner_id: &str,
        file_path: &Path,
        file_bytes: &[u8],
    ) -> Option<Vec<Finding>> {
        let key = Self::key(scanner_id, file_path, &Self::content_hash(file_bytes));
        let now = Utc::now();
        match self.entries.get(&key) {
            Some(entry) if !entry.expired_at(now) => {
                self.stats.hits += 1;
                Some(entry.findings.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                self.dirty = true;
                self.stats.evictions += 1;
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn put(
        &mut self,
        scanner_id: &str,
        file_path: &Path,
        file_bytes: &[u8],
        findings: Vec<Finding>,
        ttl: Option<Duration>,
    ) {
        let content_hash = Self::content_hash(file_bytes);
        let key = Self::key(scanner_id, file_path, &content_hash);
        self.entries.insert(
            key,
            CacheEntry {
                scanner_id: scanner_id.to_string(),
                file_path: file_path.to_path_buf(),
                content_hash,
                findings,
                cached_at: Utc::now(),
                ttl_ms: ttl.unwrap_or(self.ttl).as_millis() as u64,
            },
        );
        self.dirty = true;
        self.evict_over_capacity();
    }

    /// Oldest-first eviction once the store exceeds its cap.
    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            self.entries.remove(&key);
            self.stats.evictions += 1;
        }
    }

    pub fn invalidate_scanner(&mut self, scanner_id: &str) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.scanner_id != scanner_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
            self.stats.evictions += removed as u64;
        }
    }

    pub fn invalidate_all(&mut self) {
        if !self.entries.is_empty() {
            self.stats.evictions += self.entries.len() as u64;
            self.entries.clear();
            self.dirty = true;
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the store if anything changed since open. Atomic: the new
    /// document is written next to the target and renamed over it.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let parent = self
            .path
            .parent()
            .ok_or_else(|| HydraErr::Fatal("cache path has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;

        let file = CacheFile {
            schema_version: SCHEMA_VERSION,
            entries: std::mem::take(&mut self.entries),
        };
        let raw = serde_json::to_vec_pretty(&file)
            .map_err(|e| HydraErr::json_parse("scan cache serialization", e))?;
        self.entries = file.entries;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&raw)?;
        tmp.persist(&self.path)
            .map_err(|e| HydraErr::Io(e.error))?;
        self.dirty = false;
        Ok(())
    }
}
