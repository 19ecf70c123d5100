//! TaskSupervisor - owns the single automation slot.
//!
//! All slot mutations go through one ractor actor, so the check-and-claim in
//! `try_start` is a single mailbox message and two callers can never both
//! see an idle slot. The handle below is what the rest of the cockpit holds:
//! it runs the environment pre-flight, forwards calls to the actor and serves
//! `status()` from a watch channel without touching the mailbox.

mod actor;
mod process;

use std::path::Path;
use std::sync::{Arc, Mutex};

use ractor::{Actor, ActorRef};
use shared_types::{TaskRunInfo, TaskStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::AutomationConfig;
use crate::relay::{CockpitEvent, OutputRelay};

pub use actor::{StartedRun, SupervisorArguments, SupervisorMsg, TaskSupervisorActor};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Another automation task is already running")]
    Busy,

    #[error("Automation environment is not ready: {0}")]
    EnvironmentInvalid(String),

    #[error("Failed to start automation process: {0}")]
    SpawnFailed(String),

    #[error("{message}")]
    ProcessFailed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task instruction is empty")]
    EmptyInstruction,

    #[error("Task supervisor unavailable: {0}")]
    Unavailable(String),
}

/// Translate a finished run into the error it represents, if any.
pub fn run_outcome(run: &TaskRunInfo) -> Result<(), TaskError> {
    match run.status {
        TaskStatus::Succeeded => Ok(()),
        TaskStatus::Cancelled => Err(TaskError::Cancelled),
        TaskStatus::Failed => Err(TaskError::ProcessFailed {
            exit_code: run.exit_code,
            message: run
                .last_error
                .clone()
                .unwrap_or_else(|| "automation process failed".to_string()),
        }),
        TaskStatus::Idle | TaskStatus::Starting | TaskStatus::Running => Ok(()),
    }
}

/// Check that the automation script and its required files are in place.
pub fn preflight(config: &AutomationConfig) -> Result<(), TaskError> {
    let mut missing = Vec::new();
    let script = config.script_path();
    if !script.is_file() {
        missing.push(format!("automation script {}", script.display()));
    }
    for path in config.required_paths() {
        if !Path::new(&path).exists() {
            missing.push(path.display().to_string());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(TaskError::EnvironmentInvalid(format!(
            "missing {}",
            missing.join(", ")
        )))
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct TaskSupervisor {
    actor: ActorRef<SupervisorMsg>,
    status_rx: watch::Receiver<TaskRunInfo>,
    finished_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<TaskRunInfo>>>>,
    config: Arc<AutomationConfig>,
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("status", &self.status().status)
            .finish_non_exhaustive()
    }
}

impl TaskSupervisor {
    /// Spawn the supervisor actor. The returned join handle completes when
    /// the actor stops.
    pub async fn spawn(
        config: AutomationConfig,
        relay: OutputRelay,
    ) -> Result<(Self, JoinHandle<()>), TaskError> {
        let (status_tx, status_rx) = watch::channel(TaskRunInfo::idle());
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (actor, handle) = Actor::spawn(
            None,
            TaskSupervisorActor,
            SupervisorArguments {
                config: config.clone(),
                relay,
                status_tx,
                finished_tx,
            },
        )
        .await
        .map_err(|e| TaskError::Unavailable(e.to_string()))?;

        Ok((
            Self {
                actor,
                status_rx,
                finished_rx: Arc::new(Mutex::new(Some(finished_rx))),
                config: Arc::new(config),
            },
            handle,
        ))
    }

    /// Claim the slot and launch the automation process for `instruction`.
    ///
    /// Returns as soon as the process is spawned. Output and lifecycle
    /// transitions arrive on the relay.
    ///
    /// A process that fails to spawn still yields `Ok`: the run is reported
    /// as Failed through its lifecycle event.
    pub async fn try_start(&self, instruction: &str) -> Result<String, TaskError> {
        self.launch(instruction, Vec::new())
            .await
            .map(|started| started.task_id)
    }

    /// Like `try_start`, publishing `announce` on the relay after the slot is
    /// claimed and before the process can emit output. The result tells
    /// whether the spawn itself failed.
    pub async fn launch(
        &self,
        instruction: &str,
        announce: Vec<CockpitEvent>,
    ) -> Result<StartedRun, TaskError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(TaskError::EmptyInstruction);
        }
        preflight(&self.config)?;

        let instruction = instruction.to_string();
        ractor::call!(self.actor, |reply| SupervisorMsg::TryStart {
            instruction,
            announce,
            reply
        })
        .map_err(|e| TaskError::Unavailable(e.to_string()))?
    }

    /// Receiver of every terminal run. Unlike relay subscriptions it is never
    /// evicted. Only the first caller gets it.
    pub fn take_finished(&self) -> Option<mpsc::UnboundedReceiver<TaskRunInfo>> {
        self.finished_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Cancel the active run, resolving once it has reached a terminal state.
    /// Returns immediately when nothing is running.
    pub async fn cancel(&self) -> Result<(), TaskError> {
        ractor::call!(self.actor, |reply| SupervisorMsg::Cancel { reply })
            .map_err(|e| TaskError::Unavailable(e.to_string()))
    }

    /// Active run, else the most recent finished run, else an idle placeholder.
    pub fn status(&self) -> TaskRunInfo {
        self.status_rx.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.status_rx.borrow().status.is_active()
    }

    /// Stop the actor, killing any running automation process.
    pub fn shutdown(&self) {
        self.actor.stop(Some("shutdown".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_preflight_reports_every_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutomationConfig {
            working_dir: dir.path().to_path_buf(),
            required_files: vec![PathBuf::from(".env")],
            ..AutomationConfig::default()
        };

        let err = preflight(&config).unwrap_err();
        let TaskError::EnvironmentInvalid(detail) = err else {
            panic!("expected EnvironmentInvalid, got {err:?}");
        };
        assert!(detail.contains("run_accessibility.sh"));
        assert!(detail.contains(".env"));

        std::fs::write(dir.path().join("run_accessibility.sh"), "exit 0\n").unwrap();
        std::fs::write(dir.path().join(".env"), "").unwrap();
        assert_eq!(preflight(&config), Ok(()));
    }

    #[test]
    fn test_run_outcome_maps_terminal_states() {
        let mut run = TaskRunInfo {
            status: TaskStatus::Failed,
            exit_code: Some(3),
            last_error: Some("exit code 3".to_string()),
            ..TaskRunInfo::idle()
        };
        assert_eq!(
            run_outcome(&run),
            Err(TaskError::ProcessFailed {
                exit_code: Some(3),
                message: "exit code 3".to_string()
            })
        );

        run.status = TaskStatus::Cancelled;
        assert_eq!(run_outcome(&run), Err(TaskError::Cancelled));
        run.status = TaskStatus::Succeeded;
        assert_eq!(run_outcome(&run), Ok(()));
    }
}
