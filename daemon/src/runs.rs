//! Bounded, process-local run history.
//!
//! Run records are not durable: they live in memory and die with the daemon.
//! The store trims oldest-first past its cap so a long-lived daemon's memory
//! stays bounded.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hydra_core::ScanMode;
use serde::Serialize;
use uuid::Uuid;

pub const MAX_STORED_RUNS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub trigger: String,
    pub target_path: PathBuf,
    pub mode: ScanMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<String>>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, RunRecord>,
    order: VecDeque<Uuid>,
}

/// Insertion-ordered map of runs with oldest-first eviction.
#[derive(Default)]
pub struct RunStore {
    inner: Mutex<Inner>,
    cap: usize,
}

impl RunStore {
    pub fn new() -> Self {
        Self::with_cap(MAX_STORED_RUNS)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cap: cap.max(1),
        }
    }

    pub fn insert(&self, record: RunRecord) {
        let mut inner = self.lock();
        inner.order.push_back(record.id);
        inner.records.insert(record.id, record);
        while inner.order.len() > self.cap {
            if let Some(evicted) = inner.order.pop_front() {
                inner.records.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<RunRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `update` to a stored record, if it survived eviction.
    pub fn update<F>(&self, id: Uuid, update: F)
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            update(record);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
