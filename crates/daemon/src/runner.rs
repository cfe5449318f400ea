//! Task runner and session supervision

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stealthwire_core::{Task, TaskId, TaskMode, TrafficCounter, TrafficRegistry};
use stealthwire_exit::ExitSession;
use stealthwire_relay::TransitSession;
use stealthwire_settings::TunnelConfig;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{Result, RunnerError};

/// How the runner reacts when a session stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionPolicy {
    /// Each session is its own fault boundary.
    Isolated {
        restart: bool,
        max_restarts: u32,
        backoff: Duration,
    },
    /// The first session to stop ends the run; the others are cancelled.
    FailFast,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self::Isolated {
            restart: false,
            max_restarts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

impl SupervisionPolicy {
    /// Isolated sessions, restarted up to `max_restarts` times.
    pub fn restarting(max_restarts: u32, backoff: Duration) -> Self {
        Self::Isolated {
            restart: true,
            max_restarts,
            backoff,
        }
    }
}

/// Record of one session run ending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub task_id: TaskId,
    pub mode: TaskMode,
    /// 0 for the first run, incremented per restart
    pub attempt: u32,
    /// `None` when the session stopped cleanly (cancellation)
    pub error: Option<String>,
    pub will_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { task_id: TaskId, attempt: u32 },
    Exited(SessionExit),
}

/// Runs one relay session per task until cancelled.
pub struct TaskRunner {
    tasks: Vec<Task>,
    policy: SupervisionPolicy,
    registry: Arc<TrafficRegistry>,
    shutdown: CancellationToken,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl TaskRunner {
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(RunnerError::EmptyTaskList);
        }
        Ok(Self {
            tasks,
            policy: SupervisionPolicy::default(),
            registry: Arc::new(TrafficRegistry::new()),
            shutdown: CancellationToken::new(),
            events: None,
        })
    }

    /// Build a runner from a validated config.
    pub fn from_config(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.tasks)
    }

    /// Load the config at `path` and build a runner for it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(TunnelConfig::load(path)?)
    }

    pub fn with_policy(mut self, policy: SupervisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share an existing registry, e.g. one a metering reporter already reads.
    pub fn with_registry(mut self, registry: Arc<TrafficRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Run under an externally owned token instead of the runner's own.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn policy(&self) -> SupervisionPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<TrafficRegistry> {
        &self.registry
    }

    /// Token that stops every session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start every session and supervise them according to the policy.
    ///
    /// Returns the exit record of every session run once the runner stops.
    /// Under `FailFast` a failing session's error is returned instead.
    pub async fn run(self) -> Result<Vec<SessionExit>> {
        info!(tasks = self.tasks.len(), policy = ?self.policy, "starting task runner");
        match self.policy {
            SupervisionPolicy::Isolated {
                restart,
                max_restarts,
                backoff,
            } => {
                let max_restarts = if restart { max_restarts } else { 0 };
                self.run_isolated(max_restarts, backoff).await
            }
            SupervisionPolicy::FailFast => self.run_fail_fast().await,
        }
    }

    async fn run_isolated(self, max_restarts: u32, backoff: Duration) -> Result<Vec<SessionExit>> {
        let mut sessions = JoinSet::new();
        for task in &self.tasks {
            self.spawn_session(&mut sessions, task.clone(), 0, Duration::ZERO);
        }

        let mut exits = Vec::new();
        while let Some(joined) = sessions.join_next().await {
            let Ok((task, attempt, result)) = joined else {
                // spawn_session catches panics, so only a runtime shutdown gets here
                continue;
            };

            let cancelled = self.shutdown.is_cancelled();
            let will_restart = !cancelled && attempt < max_restarts;
            let exit = self.record_exit(&task, attempt, result, will_restart);
            exits.push(exit);

            if will_restart {
                self.spawn_session(&mut sessions, task, attempt + 1, backoff);
            }
        }

        if self.shutdown.is_cancelled() {
            info!(sessions = self.tasks.len(), "task runner stopped");
            Ok(exits)
        } else {
            error!(sessions = self.tasks.len(), "every session has stopped");
            Err(RunnerError::AllSessionsStopped(self.tasks.len()))
        }
    }

    async fn run_fail_fast(self) -> Result<Vec<SessionExit>> {
        // Sessions run under a child token so a failure does not cancel the
        // caller's token.
        let sessions_token = self.shutdown.child_token();
        let runner = TaskRunner {
            shutdown: sessions_token.clone(),
            ..self
        };

        let mut sessions = JoinSet::new();
        for task in &runner.tasks {
            runner.spawn_session(&mut sessions, task.clone(), 0, Duration::ZERO);
        }

        let first = sessions.join_next().await;
        sessions_token.cancel();

        let mut exits = Vec::new();
        let mut failure = None;
        if let Some(Ok((task, attempt, result))) = first {
            if let Err(e) = result {
                exits.push(runner.record_exit(&task, attempt, Err(e.to_string()), false));
                failure = Some(e);
            } else {
                exits.push(runner.record_exit(&task, attempt, Ok::<(), String>(()), false));
            }
        }

        while let Some(joined) = sessions.join_next().await {
            if let Ok((task, attempt, result)) = joined {
                let result = result.map_err(|e| e.to_string());
                exits.push(runner.record_exit(&task, attempt, result, false));
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(exits),
        }
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<(Task, u32, Result<()>)>,
        task: Task,
        attempt: u32,
        delay: Duration,
    ) {
        let counter = self.registry.counter(task.id);
        let shutdown = self.shutdown.clone();
        let events = self.events.clone();

        sessions.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return (task, attempt, Ok(())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if let Some(events) = &events {
                let _ = events.send(SessionEvent::Started {
                    task_id: task.id,
                    attempt,
                });
            }

            let span = info_span!("task", id = task.id, mode = %task.mode);
            let session = tokio::spawn(run_session(task.clone(), counter, shutdown).instrument(span));
            let result = match session.await {
                Ok(result) => result,
                Err(e) => {
                    error!(task_id = task.id, error = %e, "session task panicked");
                    Err(RunnerError::SessionPanicked(task.id))
                }
            };
            (task, attempt, result)
        });
    }

    fn record_exit<E: ToString>(
        &self,
        task: &Task,
        attempt: u32,
        result: std::result::Result<(), E>,
        will_restart: bool,
    ) -> SessionExit {
        let exit = SessionExit {
            task_id: task.id,
            mode: task.mode,
            attempt,
            error: result.err().map(|e| e.to_string()),
            will_restart,
        };

        match &exit.error {
            None => info!(task_id = task.id, mode = %task.mode, "session stopped"),
            Some(e) => warn!(
                task_id = task.id,
                mode = %task.mode,
                attempt,
                will_restart,
                error = %e,
                "session failed"
            ),
        }

        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::Exited(exit.clone()));
        }
        exit
    }
}

/// Build and run the relay session for one task until `shutdown`.
pub async fn run_session(task: Task, counter: Arc<TrafficCounter>, shutdown: CancellationToken) -> Result<()> {
    match task.mode {
        TaskMode::Transit => {
            TransitSession::from_task(&task, counter)?.start(shutdown).await?;
        }
        TaskMode::Exit => {
            ExitSession::from_task(&task, counter)?.start(shutdown).await?;
        }
    }
    Ok(())
}
