//! Bounded-concurrency agent dispatcher.
//!
//! Tasks are dequeued FIFO and at most `max_concurrent` run at once. Each
//! task races a per-task deadline; a deadline miss produces a `timed_out`
//! record and the task's findings are discarded. One task failing, timing
//! out, or panicking never disturbs the others, and the dispatcher always
//! settles with every record in a terminal state.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::finding::Finding;

/// One executable unit: an id, an executor future, and an optional deadline
/// override (LLM-backed tasks get a longer one).
pub struct AgentTask {
    pub agent_id: String,
    pub timeout: Option<Duration>,
    future: BoxFuture<'static, Result<Vec<Finding>>>,
}

impl AgentTask {
    pub fn new<F>(agent_id: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Vec<Finding>>> + Send + 'static,
    {
        Self {
            agent_id: agent_id.into(),
            timeout: None,
            future: Box::pin(future),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::TimedOut
        )
    }
}

/// Lifecycle record of a single agent task. Transitions are monotonic
/// (queued → running → terminal) and terminal states are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub agent_id: String,
    pub status: AgentStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub finding_count: Option<usize>,
    pub error: Option<String>,
}

impl AgentRun {
    fn queued(agent_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            status: AgentStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            finding_count: None,
            error: None,
        }
    }

    fn begin(&mut self) {
        debug_assert_eq!(self.status, AgentStatus::Queued);
        self.status = AgentStatus::Running;
        self.started_at = Some(Utc::now());
    }

    fn finish(&mut self, status: AgentStatus, duration_ms: u64) {
        debug_assert!(!self.status.is_terminal());
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
    }
}

enum TaskVerdict {
    Completed(Vec<Finding>),
    Failed(String),
    TimedOut,
}

#[derive(Default)]
pub struct DispatchOutcome {
    /// Accumulated in task *completion* order.
    pub findings: Vec<Finding>,
    /// One record per enqueued task, all terminal.
    pub agent_runs: Vec<AgentRun>,
}

/// Cooperative executor for a heterogeneous batch of agent tasks.
pub struct Dispatcher {
    max_concurrent: usize,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(max_concurrent: usize, default_timeout: Duration) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            default_timeout,
        }
    }

    /// Run every task to a terminal state. A cancelled token stops further
    /// dequeuing; in-flight tasks still settle, and never-started tasks are
    /// recorded as failed with a cancellation error.
    pub async fn run(&self, tasks: Vec<AgentTask>, cancel: &CancellationToken) -> DispatchOutcome {
        let mut agent_runs: Vec<AgentRun> =
            tasks.iter().map(|t| AgentRun::queued(&t.agent_id)).collect();
        let mut queue: VecDeque<(usize, AgentTask)> = tasks.into_iter().enumerate().collect();
        let mut in_flight: JoinSet<(usize, TaskVerdict, u64)> = JoinSet::new();
        let mut findings = Vec::new();

        loop {
            while in_flight.len() < self.max_concurrent && !cancel.is_cancelled() {
                let Some((index, task)) = queue.pop_front() else {
                    break;
                };
                agent_runs[index].begin();
                let deadline = task.timeout.unwrap_or(self.default_timeout);
                debug!(agent_id = %task.agent_id, ?deadline, "agent task started");
                in_flight.spawn(async move {
                    let started = tokio::time::Instant::now();
                    let verdict = match tokio::time::timeout(deadline, task.future).await {
                        Ok(Ok(found)) => TaskVerdict::Completed(found),
                        Ok(Err(error)) => TaskVerdict::Failed(error.to_string()),
                        Err(_) => TaskVerdict::TimedOut,
                    };
                    (index, verdict, started.elapsed().as_millis() as u64)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                if queue.is_empty() || cancel.is_cancelled() {
                    break;
                }
                continue;
            };

            match joined {
                Ok((index, verdict, duration_ms)) => {
                    let run = &mut agent_runs[index];
                    match verdict {
                        TaskVerdict::Completed(found) => {
                            run.finding_count = Some(found.len());
                            run.finish(AgentStatus::Completed, duration_ms);
                            findings.extend(found);
                        }
                        TaskVerdict::Failed(error) => {
                            warn!(agent_id = %run.agent_id, %error, "agent task failed");
                            run.error = Some(error);
                            run.finish(AgentStatus::Failed, duration_ms);
                        }
                        TaskVerdict::TimedOut => {
                            warn!(agent_id = %run.agent_id, "agent task timed out");
                            run.finish(AgentStatus::TimedOut, duration_ms);
                        }
                    }
                }
                Err(join_error) => {
                    // A panicking task must not poison the batch; the record
                    // carries the panic message. Which task panicked is not
                    // recoverable from the JoinError payload alone, so find
                    // the run still marked running with the earliest start.
                    warn!(%join_error, "agent task panicked");
                    if let Some(run) = agent_runs
                        .iter_mut()
                        .filter(|r| r.status == AgentStatus::Running)
                        .min_by_key(|r| r.started_at)
                    {
                        run.error = Some(join_error.to_string());
                        run.finish(AgentStatus::Failed, 0);
                    }
                }
            }
        }

        // Anything still queued after a cancel never ran.
        for (index, task) in queue {
            let run = &mut agent_runs[index];
            run.error = Some(format!("cancelled before start: {}", task.agent_id));
            run.finish(AgentStatus::Failed, 0);
        }

        DispatchOutcome {
            findings,
            agent_runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HydraErr;
    use crate::finding::{Severity, VulnClass};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_finding(scanner: &str) -> Finding {
        Finding::new(
            scanner,
            VulnClass::Other,
            Severity::Low,
            50,
            PathBuf::from("/repo/x.rs"),
            1,
            "t",
            "d",
            "e",
        )
    }

    fn sleeping_task(
        id: &str,
        millis: u64,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> AgentTask {
        let scanner = id.to_string();
        AgentTask::new(id, async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![fake_finding(&scanner)])
        })
    }

    // Paused virtual time makes the 100..500ms schedule exact: with two
    // workers pulling FIFO the batch finishes at t=900ms sharp.
    #[tokio::test(start_paused = true)]
    async fn bound_holds_and_schedule_is_work_conserving() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<AgentTask> = [100u64, 200, 300, 400, 500]
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                sleeping_task(&format!("agent-{i}"), *ms, current.clone(), peak.clone())
            })
            .collect();

        let dispatcher = Dispatcher::new(2, Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let outcome = dispatcher.run(tasks, &CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(900), "elapsed {elapsed:?}");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.findings.len(), 5);
        assert!(outcome.agent_runs.iter().all(|r| r.status == AgentStatus::Completed));
    }

    #[tokio::test]
    async fn timeout_discards_findings() {
        let slow = AgentTask::new("slow", async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(vec![fake_finding("slow")])
        })
        .with_timeout(Duration::from_millis(20));
        let fast = AgentTask::new("fast", async { Ok(vec![fake_finding("fast")]) });

        let dispatcher = Dispatcher::new(3, Duration::from_secs(5));
        let outcome = dispatcher.run(vec![slow, fast], &CancellationToken::new()).await;

        let slow_run = outcome.agent_runs.iter().find(|r| r.agent_id == "slow").unwrap();
        assert_eq!(slow_run.status, AgentStatus::TimedOut);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].scanner_id, "fast");
    }

    #[tokio::test]
    async fn failure_does_not_disturb_other_tasks() {
        let failing = AgentTask::new("failing", async {
            Err(HydraErr::Fatal("scanner exploded".to_string()))
        });
        let ok = AgentTask::new("ok", async { Ok(vec![fake_finding("ok")]) });

        let dispatcher = Dispatcher::new(2, Duration::from_secs(5));
        let outcome = dispatcher.run(vec![failing, ok], &CancellationToken::new()).await;

        let failed = outcome.agent_runs.iter().find(|r| r.agent_id == "failing").unwrap();
        assert_eq!(failed.status, AgentStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("scanner exploded"));
        assert_eq!(outcome.findings.len(), 1);
    }

    #[tokio::test]
    async fn all_runs_terminal_after_settle() {
        let tasks: Vec<AgentTask> = (0..10)
            .map(|i| {
                AgentTask::new(format!("agent-{i}"), async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(Vec::new())
                })
            })
            .collect();
        let dispatcher = Dispatcher::new(3, Duration::from_secs(5));
        let outcome = dispatcher.run(tasks, &CancellationToken::new()).await;
        assert_eq!(outcome.agent_runs.len(), 10);
        assert!(outcome.agent_runs.iter().all(|r| r.status.is_terminal()));
    }

    #[tokio::test]
    async fn cancel_stops_dequeuing_but_settles_in_flight() {
        let cancel = CancellationToken::new();
        let cancel_inner = cancel.clone();
        let first = AgentTask::new("first", async move {
            cancel_inner.cancel();
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(vec![fake_finding("first")])
        });
        let second = AgentTask::new("second", async { Ok(vec![fake_finding("second")]) });

        let dispatcher = Dispatcher::new(1, Duration::from_secs(5));
        let outcome = dispatcher.run(vec![first, second], &cancel).await;

        let first_run = outcome.agent_runs.iter().find(|r| r.agent_id == "first").unwrap();
        let second_run = outcome.agent_runs.iter().find(|r| r.agent_id == "second").unwrap();
        assert_eq!(first_run.status, AgentStatus::Completed);
        assert_eq!(second_run.status, AgentStatus::Failed);
        assert!(second_run.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(outcome.findings.len(), 1);
    }

    #[tokio::test]
    async fn start_order_follows_queue_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let tasks: Vec<AgentTask> = (0..4)
            .map(|i| {
                let order = order.clone();
                AgentTask::new(format!("agent-{i}"), async move {
                    order.lock().unwrap().push(i);
                    Ok(Vec::new())
                })
            })
            .collect();

        let dispatcher = Dispatcher::new(1, Duration::from_secs(5));
        dispatcher.run(tasks, &CancellationToken::new()).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
