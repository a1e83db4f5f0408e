//! HTTP trigger daemon.
//!
//! A small axum surface that accepts scan triggers, tracks a bounded,
//! process-local run history, and executes scans asynchronously. Startup is
//! secure by default: without a bearer token (and with no explicit opt-in to
//! insecure defaults) the daemon refuses to come up, and a configured path
//! allow-list is enforced after full canonicalization so symlinks cannot
//! escape it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use hydra_core::config::EngineConfig;
use hydra_core::orchestrator::{DiffOptions, ScanOptions, ScanOrchestrator};
use hydra_core::reasoner::HttpReasoner;
use hydra_core::sandbox::SandboxSupervisor;
use hydra_core::target::ScanMode;

pub mod auth;
pub mod runs;
pub mod webhook;

use auth::authorized;
use runs::{RunRecord, RunStatus, RunStore};

pub const ENV_DAEMON_TOKEN: &str = "HYDRA_DAEMON_TOKEN";
pub const ENV_ALLOWED_PATHS: &str = "HYDRA_ALLOWED_PATHS";
pub const ENV_ALLOW_INSECURE_DEFAULTS: &str = "HYDRA_ALLOW_INSECURE_DEFAULTS";

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DaemonErr {
    #[error(
        "no daemon token configured; set {ENV_DAEMON_TOKEN} or explicitly opt in with \
         {ENV_ALLOW_INSECURE_DEFAULTS}=1"
    )]
    MissingToken,

    #[error("allow-list entry {entry:?} is not a resolvable directory: {cause}")]
    InvalidAllowedPath { entry: String, cause: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    /// Canonicalized directories a target may live under. Empty = no check.
    pub allowed_paths: Vec<PathBuf>,
}

impl DaemonConfig {
    /// Read and validate the daemon environment. Fails closed: a missing
    /// token or an unresolvable allow-list entry aborts startup.
    pub fn from_env(host: String, port: u16) -> Result<Self, DaemonErr> {
        let insecure = std::env::var(ENV_ALLOW_INSECURE_DEFAULTS).as_deref() == Ok("1");
        let token = std::env::var(ENV_DAEMON_TOKEN).ok().filter(|t| !t.is_empty());
        if token.is_none() && !insecure {
            return Err(DaemonErr::MissingToken);
        }
        if token.is_none() {
            warn!("daemon running without authentication (insecure defaults opt-in)");
        }

        let mut allowed_paths = Vec::new();
        if let Ok(raw) = std::env::var(ENV_ALLOWED_PATHS) {
            for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                allowed_paths.push(canonical_dir(Path::new(entry)).map_err(|cause| {
                    DaemonErr::InvalidAllowedPath {
                        entry: entry.to_string(),
                        cause,
                    }
                })?);
            }
        }
        if allowed_paths.is_empty() && !insecure {
            warn!("no path allow-list configured; any readable directory can be scanned");
        }

        Ok(Self {
            host,
            port,
            token,
            allowed_paths,
        })
    }
}

fn canonical_dir(path: &Path) -> Result<PathBuf, String> {
    let canonical = path.canonicalize().map_err(|e| e.to_string())?;
    if !canonical.is_dir() {
        return Err("not a directory".to_string());
    }
    Ok(canonical)
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<DaemonConfig>,
    runs: Arc<RunStore>,
    in_flight: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Arc::new(config),
            runs: Arc::new(RunStore::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/trigger", post(trigger))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .with_state(state)
}

/// Bind and serve until shutdown, then wait for in-flight runs to settle.
pub async fn serve(config: DaemonConfig) -> Result<(), DaemonErr> {
    let state = AppState::new(config);
    let app = router(state.clone());
    let listener =
        tokio::net::TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(
        host = %state.config.host,
        port = state.config.port,
        "trigger daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    while state.in_flight.load(Ordering::SeqCst) > 0 {
        info!(
            in_flight = state.in_flight.load(Ordering::SeqCst),
            "waiting for in-flight runs to settle"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_runs(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(state.config.token.as_deref(), &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    Json(state.runs.list()).into_response()
}

async fn get_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if !authorized(state.config.token.as_deref(), &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::NOT_FOUND, "run_not_found");
    };
    match state.runs.get(id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "run_not_found"),
    }
}

async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    if !authorized(state.config.token.as_deref(), &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let body: Bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request_too_large"),
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_json");
    };

    // Validation order mirrors the API contract; nothing is partially applied.
    let Some(target_path) = payload["target_path"].as_str().filter(|p| !p.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing_target_path");
    };

    let mode = match payload.get("mode").and_then(Value::as_str) {
        None => ScanMode::Full,
        Some(raw) => match ScanMode::parse(raw) {
            Some(mode) => mode,
            None => return error_response(StatusCode::BAD_REQUEST, "invalid_mode"),
        },
    };

    let base_ref = payload.get("base_ref").and_then(Value::as_str).map(str::to_string);
    let head_ref = payload.get("head_ref").and_then(Value::as_str).map(str::to_string);
    if head_ref.is_some() && base_ref.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "head_ref_requires_base_ref");
    }

    let changed_files = match payload.get("changed_files") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut files = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(file) => files.push(file.to_string()),
                    None => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            "changed_files_must_be_array",
                        );
                    }
                }
            }
            Some(files)
        }
        Some(_) => {
            return error_response(StatusCode::BAD_REQUEST, "changed_files_must_be_array");
        }
    };

    let canonical_target = match canonical_dir(Path::new(target_path)) {
        Ok(dir) => dir,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid_target_path"),
    };
    if !path_allowed(&state.config.allowed_paths, &canonical_target) {
        return error_response(StatusCode::FORBIDDEN, "path_not_allowed");
    }

    let trigger_kind = payload
        .get("trigger")
        .and_then(Value::as_str)
        .unwrap_or("http")
        .to_string();

    let record = RunRecord {
        id: Uuid::new_v4(),
        trigger: trigger_kind,
        target_path: canonical_target.clone(),
        mode,
        base_ref: base_ref.clone(),
        head_ref: head_ref.clone(),
        changed_files: changed_files.clone(),
        status: RunStatus::Queued,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error: None,
        result: None,
    };
    let run_id = record.id;
    state.runs.insert(record.clone());
    schedule_run(state.clone(), record);

    let mut response = json!({
        "run_id": run_id,
        "status": "queued",
        "target_path": canonical_target,
        "mode": mode,
    });
    if let Some(base) = base_ref {
        response["base_ref"] = json!(base);
    }
    if let Some(head) = head_ref {
        response["head_ref"] = json!(head);
    }
    if let Some(files) = changed_files {
        response["changed_files"] = json!(files);
    }
    (StatusCode::ACCEPTED, Json(response)).into_response()
}

/// Target must equal an allow-list entry or sit strictly under one. Both
/// sides are canonical by the time this runs.
fn path_allowed(allowed: &[PathBuf], target: &Path) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|entry| target.starts_with(entry))
}

/// Fire-and-forget execution; the stored record carries the outcome.
fn schedule_run(state: AppState, record: RunRecord) {
    let run_id = record.id;
    state.in_flight.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        state.runs.update(run_id, |stored| {
            stored.status = RunStatus::Running;
            stored.started_at = Some(Utc::now());
        });

        let outcome = execute_scan(
            &record.target_path,
            record.mode,
            record.base_ref.clone(),
            record.head_ref.clone(),
            record.changed_files.clone(),
        )
        .await;

        state.runs.update(run_id, |record| {
            record.completed_at = Some(Utc::now());
            match &outcome {
                Ok(result) => {
                    record.status = RunStatus::Completed;
                    record.result = Some(result.clone());
                }
                Err(message) => {
                    record.status = RunStatus::Failed;
                    record.error = Some(message.clone());
                }
            }
        });
        if let Err(message) = outcome {
            error!(%run_id, %message, "run failed");
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
    });
}

async fn execute_scan(
    target: &Path,
    mode: ScanMode,
    base_ref: Option<String>,
    head_ref: Option<String>,
    changed_files: Option<Vec<String>>,
) -> Result<Value, String> {
    let config = EngineConfig::load(target).map_err(|e| e.to_string())?;
    let reasoner = HttpReasoner::from_env().map_err(|e| e.to_string())?;
    let orchestrator =
        ScanOrchestrator::new(config, reasoner, Arc::new(SandboxSupervisor::default()));

    let report = match mode {
        ScanMode::Full => {
            orchestrator
                .run_full_scan(target, ScanOptions::default())
                .await
        }
        ScanMode::Diff => {
            let diff = DiffOptions {
                base_ref,
                head_ref,
                changed_files: changed_files
                    .map(|files| files.into_iter().map(PathBuf::from).collect()),
            };
            orchestrator
                .run_diff_scan(target, diff, ScanOptions::default())
                .await
        }
    }
    .map_err(|e| e.to_string())?;

    serde_json::to_value(&report).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_allowed_requires_prefix_containment() {
        let allowed = vec![PathBuf::from("/home/work")];
        assert!(path_allowed(&allowed, Path::new("/home/work")));
        assert!(path_allowed(&allowed, Path::new("/home/work/repo")));
        assert!(!path_allowed(&allowed, Path::new("/home/worker")));
        assert!(!path_allowed(&allowed, Path::new("/etc")));
        assert!(path_allowed(&[], Path::new("/anywhere")));
    }
}
