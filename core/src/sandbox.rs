//! Ephemeral hardened execution environments.
//!
//! Sessions are containers driven through the runtime CLI (`docker` or a
//! compatible drop-in). Every session is created with the full hardening
//! set: non-root user, read-only root, noexec tmpfs mounts, all capabilities
//! dropped, no-new-privileges, bounded pids/memory/cpu, and no network
//! unless the profile says otherwise. Exec wall-time caps are enforced here,
//! not trusted to the guest. Destruction is idempotent and also runs on
//! drop, so a panicking caller cannot leak a container.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxErr;

pub const ENV_CONTAINER_RUNTIME: &str = "HYDRA_CONTAINER_RUNTIME";

const DEFAULT_RUNTIME: &str = "docker";
const CREATE_TIMEOUT: Duration = Duration::from_secs(30);
const DESTROY_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Synthetic exit code reported when the wall-time cap fires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured output is truncated beyond this many bytes per stream.
const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxProfile {
    Generic,
    Solana,
}

impl SandboxProfile {
    pub fn image(&self) -> &'static str {
        match self {
            SandboxProfile::Generic => "hydra-sandbox:generic",
            SandboxProfile::Solana => "hydra-sandbox:solana",
        }
    }

    fn network(&self) -> &'static str {
        match self {
            SandboxProfile::Generic => "none",
            // Exploit candidates need to reach the local test validator.
            SandboxProfile::Solana => "container:hydra-validator",
        }
    }

    fn memory(&self) -> &'static str {
        match self {
            SandboxProfile::Generic => "512m",
            SandboxProfile::Solana => "2g",
        }
    }

    fn cpus(&self) -> &'static str {
        match self {
            SandboxProfile::Generic => "1.0",
            SandboxProfile::Solana => "2.0",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SandboxProfile::Generic => "generic",
            SandboxProfile::Solana => "solana",
        }
    }
}

/// Per-session resource overrides; unset fields fall back to the profile.
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub memory: Option<String>,
    pub cpus: Option<String>,
    pub network: Option<String>,
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Factory and probe surface for sandbox sessions.
#[derive(Debug, Clone)]
pub struct SandboxSupervisor {
    runtime_bin: String,
}

impl Default for SandboxSupervisor {
    fn default() -> Self {
        let runtime_bin =
            std::env::var(ENV_CONTAINER_RUNTIME).unwrap_or_else(|_| DEFAULT_RUNTIME.to_string());
        Self { runtime_bin }
    }
}

impl SandboxSupervisor {
    pub fn with_runtime(runtime_bin: impl Into<String>) -> Self {
        Self {
            runtime_bin: runtime_bin.into(),
        }
    }

    /// Whether the container runtime answers at all. Never errors.
    pub async fn is_runtime_available(&self) -> bool {
        run_runtime(
            &self.runtime_bin,
            &["version", "--format", "{{.Server.Version}}"],
            PROBE_TIMEOUT,
        )
        .await
        .map(|outcome| outcome.exit_code == 0)
        .unwrap_or(false)
    }

    /// Whether the profile's image exists locally. Never errors.
    pub async fn is_image_built(&self, profile: SandboxProfile) -> bool {
        run_runtime(
            &self.runtime_bin,
            &["image", "inspect", profile.image()],
            PROBE_TIMEOUT,
        )
        .await
        .map(|outcome| outcome.exit_code == 0)
        .unwrap_or(false)
    }

    pub async fn create(
        &self,
        profile: SandboxProfile,
        overrides: SessionOverrides,
    ) -> Result<SandboxSession, SandboxErr> {
        let name = format!("hydra-sbx-{}", Uuid::new_v4().simple());
        let memory = overrides.memory.as_deref().unwrap_or(profile.memory());
        let cpus = overrides.cpus.as_deref().unwrap_or(profile.cpus());
        let network = overrides.network.as_deref().unwrap_or(profile.network());

        let args = [
            "run",
            "-d",
            "--name",
            &name,
            "--user",
            "1000:1000",
            "--read-only",
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,nodev,size=256m",
            "--tmpfs",
            "/workspace:rw,noexec,nosuid,nodev,size=256m",
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--network",
            network,
            "--pids-limit",
            "256",
            "--memory",
            memory,
            "--cpus",
            cpus,
            profile.image(),
            "sleep",
            "infinity",
        ];

        let outcome = run_runtime(&self.runtime_bin, &args, CREATE_TIMEOUT).await?;
        if outcome.timed_out {
            // The container may have half-started; clean it up blind.
            let _ = run_runtime(&self.runtime_bin, &["rm", "-f", &name], DESTROY_TIMEOUT).await;
            return Err(SandboxErr::CreateTimeout {
                timeout_ms: CREATE_TIMEOUT.as_millis() as u64,
            });
        }
        if outcome.exit_code != 0 {
            let stderr = outcome.stderr.trim();
            if stderr.contains("No such image") || stderr.contains("Unable to find image") {
                return Err(SandboxErr::ImageMissing {
                    profile: profile.name().to_string(),
                });
            }
            return Err(SandboxErr::Runtime {
                cause: stderr.to_string(),
            });
        }

        debug!(%name, profile = profile.name(), "sandbox session created");
        Ok(SandboxSession {
            runtime_bin: self.runtime_bin.clone(),
            name,
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// One live container. Exclusive to its owning task.
#[derive(Debug)]
pub struct SandboxSession {
    runtime_bin: String,
    name: String,
    destroyed: Arc<AtomicBool>,
}

impl SandboxSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `argv` inside the session under a wall-time cap. A cap miss is a
    /// typed outcome (`exit_code` 124, `timed_out` set), not an error.
    pub async fn exec(
        &self,
        argv: &[&str],
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, SandboxErr> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxErr::SessionDestroyed);
        }
        let mut args = vec!["exec", self.name.as_str()];
        args.extend_from_slice(argv);
        run_runtime(
            &self.runtime_bin,
            &args,
            timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT),
        )
        .await
    }

    /// Place `bytes` at `guest_path` inside the session.
    pub async fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxErr> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tmp, bytes)?;
        self.copy_in(tmp.path(), guest_path).await
    }

    pub async fn copy_in(&self, host_path: &Path, guest_path: &str) -> Result<(), SandboxErr> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SandboxErr::SessionDestroyed);
        }
        let target = format!("{}:{guest_path}", self.name);
        let host = host_path.to_string_lossy();
        let outcome = run_runtime(
            &self.runtime_bin,
            &["cp", host.as_ref(), &target],
            DEFAULT_EXEC_TIMEOUT,
        )
        .await?;
        if outcome.exit_code != 0 {
            return Err(SandboxErr::Runtime {
                cause: outcome.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Tear the container down. Safe to call any number of times.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        match run_runtime(
            &self.runtime_bin,
            &["rm", "-f", &self.name],
            DESTROY_TIMEOUT,
        )
        .await
        {
            Ok(outcome) if outcome.exit_code == 0 => {
                debug!(name = %self.name, "sandbox session destroyed");
            }
            Ok(outcome) => warn!(
                name = %self.name,
                stderr = %outcome.stderr.trim(),
                "sandbox destroy reported failure"
            ),
            Err(error) => warn!(name = %self.name, %error, "sandbox destroy errored"),
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Last-resort reap without an executor: detached fire-and-forget.
        let result = std::process::Command::new(&self.runtime_bin)
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(error) = result {
            warn!(name = %self.name, %error, "sandbox drop-reap failed to spawn");
        }
    }
}

/// Spawn the runtime binary, cap its wall time, and capture both streams
/// with per-stream truncation. The cap kills the child and reports the
/// conventional timeout exit code.
async fn run_runtime(
    runtime_bin: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ExecOutcome, SandboxErr> {
    let started = tokio::time::Instant::now();
    let mut child = Command::new(runtime_bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxErr::RuntimeUnavailable,
            _ => SandboxErr::Io(e),
        })?;

    let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
        SandboxErr::Runtime {
            cause: "stdout pipe unavailable".to_string(),
        }
    })?;
    let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
        SandboxErr::Runtime {
            cause: "stderr pipe unavailable".to_string(),
        }
    })?;

    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut tmp_stdout = [0u8; READ_CHUNK_SIZE];
    let mut tmp_stderr = [0u8; READ_CHUNK_SIZE];

    let mut exit_code: Option<i32> = None;
    let mut timed_out = false;
    let mut child_finished = false;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while stdout_open || stderr_open || !child_finished {
        tokio::select! {
            _ = &mut deadline, if !child_finished => {
                let _ = child.start_kill();
                timed_out = true;
                exit_code = Some(TIMEOUT_EXIT_CODE);
                child_finished = true;
            }

            status = child.wait(), if !child_finished => {
                match status {
                    Ok(status) => exit_code = Some(status.code().unwrap_or(-1)),
                    Err(e) => return Err(SandboxErr::Io(e)),
                }
                child_finished = true;
            }

            read = stdout_pipe.read(&mut tmp_stdout), if stdout_open => {
                match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => append_capped(&mut stdout, &tmp_stdout[..n]),
                    Err(_) => stdout_open = false,
                }
            }

            read = stderr_pipe.read(&mut tmp_stderr), if stderr_open => {
                match read {
                    Ok(0) => stderr_open = false,
                    Ok(n) => append_capped(&mut stderr, &tmp_stderr[..n]),
                    Err(_) => stderr_open = false,
                }
            }
        }

        // Once killed there is nothing more worth draining.
        if timed_out {
            break;
        }
    }

    Ok(ExecOutcome {
        exit_code: exit_code.unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        timed_out,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn append_capped(dst: &mut Vec<u8>, src: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(dst.len());
    let take = room.min(src.len());
    dst.extend_from_slice(&src[..take]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn missing_runtime_probes_false_without_error() {
        let supervisor = SandboxSupervisor::with_runtime("hydra-no-such-runtime");
        assert!(!supervisor.is_runtime_available().await);
        assert!(!supervisor.is_image_built(SandboxProfile::Generic).await);
    }

    #[tokio::test]
    async fn missing_runtime_create_is_typed() {
        let supervisor = SandboxSupervisor::with_runtime("hydra-no-such-runtime");
        let err = supervisor
            .create(SandboxProfile::Generic, SessionOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxErr::RuntimeUnavailable));
    }

    #[tokio::test]
    async fn wall_time_cap_yields_timeout_exit_code() {
        let outcome = run_runtime("sh", &["-c", "sleep 5"], Duration::from_millis(50))
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(outcome.duration_ms < 2_000);
    }

    #[tokio::test]
    async fn fast_command_is_captured_whole() {
        let outcome = run_runtime(
            "sh",
            &["-c", "echo out; echo err >&2"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn capture_is_truncated_not_unbounded() {
        let mut big = Vec::new();
        append_capped(&mut big, &vec![b'x'; MAX_CAPTURE_BYTES + 1024]);
        assert_eq!(big.len(), MAX_CAPTURE_BYTES);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_verbatim() {
        let outcome = run_runtime("sh", &["-c", "exit 3"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
    }
}
