//! Error types for the audit engine.
//!
//! Stage-local failures (a scanner throwing, a reasoner returning garbage, a
//! sandbox that is not installed) are captured as typed *results* inside the
//! stage that observed them and never cross component boundaries as errors.
//! `HydraErr` is reserved for the cases that genuinely abort a scan: invalid
//! input at ingress, I/O on our own state files, and invariant violations.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HydraErr {
    #[error("invalid scan target: {path:?}: {reason}")]
    InvalidTarget { path: PathBuf, reason: String },

    #[error("head_ref requires base_ref")]
    HeadRefWithoutBaseRef,

    #[error("invalid configuration value for {name}: {value:?}")]
    InvalidConfig { name: String, value: String },

    #[error("JSON error: context={context}, cause={cause}")]
    Json { context: String, cause: String },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("reasoner error: {0}")]
    Reasoner(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the engine. The only kind that aborts a
    /// scan outright; the surrounding run record is marked failed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HydraErr {
    pub fn json_parse(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Json {
            context: context.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Failures of the container runtime underneath the sandbox supervisor.
///
/// Callers decide whether to degrade (run a debate without sandbox evidence)
/// rather than abort; none of these escapes a pipeline stage.
#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error("container runtime is not available")]
    RuntimeUnavailable,

    #[error("sandbox image for profile {profile} is not built")]
    ImageMissing { profile: String },

    #[error("container runtime failed: {cause}")]
    Runtime { cause: String },

    #[error("timed out after {timeout_ms}ms while creating sandbox")]
    CreateTimeout { timeout_ms: u64 },

    #[error("sandbox session was already destroyed")]
    SessionDestroyed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HydraErr>;
