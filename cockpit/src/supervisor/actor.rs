//! TaskSupervisorActor - serializes every transition of the automation slot.

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{OutputLine, TaskRunInfo, TaskStatus};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::process::{self, Signal};
use super::TaskError;
use crate::classify::classify_line;
use crate::config::AutomationConfig;
use crate::relay::{CockpitEvent, OutputRelay};

pub struct TaskSupervisorActor;

pub struct SupervisorArguments {
    pub config: AutomationConfig,
    pub relay: OutputRelay,
    pub status_tx: watch::Sender<TaskRunInfo>,
    /// Every terminal run, independent of relay back-pressure
    pub finished_tx: mpsc::UnboundedSender<TaskRunInfo>,
}

/// Reply to `TryStart` once the slot was claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRun {
    pub task_id: String,
    /// Set when the process could not be spawned; the run is already Failed.
    pub spawn_error: Option<TaskError>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum SupervisorMsg {
    /// Claim the slot and spawn the automation process
    /// `announce` is published after `Starting` and before the spawn.
    TryStart {
        instruction: String,
        announce: Vec<CockpitEvent>,
        reply: RpcReplyPort<Result<StartedRun, TaskError>>,
    },
    /// Cancel the active run; replied to once the run is terminal
    Cancel { reply: RpcReplyPort<()> },
    /// Internal: one captured output line
    OutputReceived { task_id: String, text: String },
    /// Internal: process exited and its output was drained
    ProcessExited {
        task_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        error: Option<String>,
    },
    /// Internal: cancellation grace period ran out
    GraceExpired { task_id: String },
}

struct ActiveRun {
    info: TaskRunInfo,
    pid: Option<u32>,
    kill: CancellationToken,
    cancel_requested: bool,
    cancel_waiters: Vec<RpcReplyPort<()>>,
}

pub struct SupervisorState {
    config: AutomationConfig,
    relay: OutputRelay,
    status_tx: watch::Sender<TaskRunInfo>,
    finished_tx: mpsc::UnboundedSender<TaskRunInfo>,
    active: Option<ActiveRun>,
}

impl SupervisorState {
    fn publish_lifecycle(&self, info: &TaskRunInfo) {
        self.status_tx.send_replace(info.clone());
        self.relay.publish(CockpitEvent::TaskLifecycle(info.clone()));
        if info.status.is_terminal() && self.finished_tx.send(info.clone()).is_err() {
            tracing::debug!(task_id = %info.id, "No receiver for finished runs");
        }
    }

    fn active_for(&mut self, task_id: &str) -> Option<&mut ActiveRun> {
        self.active.as_mut().filter(|run| run.info.id == task_id)
    }
}

// ============================================================================
// Actor Implementation
// ============================================================================

#[async_trait]
impl Actor for TaskSupervisorActor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = SupervisorArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(SupervisorState {
            config: args.config,
            relay: args.relay,
            status_tx: args.status_tx,
            finished_tx: args.finished_tx,
            active: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMsg::TryStart {
                instruction,
                announce,
                reply,
            } => {
                let result = self.try_start(myself, state, instruction, announce);
                let _ = reply.send(result);
            }

            SupervisorMsg::Cancel { reply } => self.cancel(myself, state, reply),

            SupervisorMsg::OutputReceived { task_id, text } => {
                let Some(run) = state.active_for(&task_id) else {
                    tracing::warn!(task_id = %task_id, "Dropping output from stale run");
                    return Ok(());
                };
                run.info.lines_emitted += 1;
                let line = OutputLine {
                    task_id,
                    seq: run.info.lines_emitted,
                    kind: classify_line(&text),
                    text,
                    timestamp: Utc::now(),
                };
                let snapshot = run.info.clone();
                state.status_tx.send_replace(snapshot);
                state.relay.publish(CockpitEvent::TaskOutput(line));
            }

            SupervisorMsg::ProcessExited {
                task_id,
                exit_code,
                signal,
                error,
            } => self.finish(state, &task_id, exit_code, signal, error),

            SupervisorMsg::GraceExpired { task_id } => {
                let grace_ms = state.config.grace_period.as_millis() as u64;
                if let Some(run) = state.active_for(&task_id) {
                    tracing::warn!(
                        task_id = %task_id,
                        grace_ms,
                        "Automation process ignored SIGTERM; killing"
                    );
                    run.kill.cancel();
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(run) = state.active.take() {
            tracing::info!(
                task_id = %run.info.id,
                "Supervisor stopping; killing automation process"
            );
            run.kill.cancel();
        }
        Ok(())
    }
}

impl TaskSupervisorActor {
    fn try_start(
        &self,
        myself: ActorRef<SupervisorMsg>,
        state: &mut SupervisorState,
        instruction: String,
        announce: Vec<CockpitEvent>,
    ) -> Result<StartedRun, TaskError> {
        if let Some(run) = &state.active {
            if run.info.status.is_active() {
                tracing::info!(task_id = %run.info.id, "Rejecting task: slot busy");
                return Err(TaskError::Busy);
            }
            debug_assert!(false, "terminal run {} still holds the slot", run.info.id);
            tracing::error!(
                task_id = %run.info.id,
                status = ?run.info.status,
                "Terminal run still held the task slot; resetting"
            );
            state.active = None;
        }

        let task_id = shared_types::new_id();
        let mut info = TaskRunInfo {
            id: task_id.clone(),
            instruction: instruction.clone(),
            status: TaskStatus::Starting,
            started_at: Some(Utc::now()),
            ..TaskRunInfo::idle()
        };
        state.publish_lifecycle(&info);
        for event in announce {
            state.relay.publish(event);
        }

        let kill = CancellationToken::new();
        let spawned =
            process::spawn_automation(&state.config, &task_id, &instruction, myself, kill.clone());
        match spawned {
            Ok(pid) => {
                info.status = TaskStatus::Running;
                state.publish_lifecycle(&info);
                state.active = Some(ActiveRun {
                    info,
                    pid,
                    kill,
                    cancel_requested: false,
                    cancel_waiters: Vec::new(),
                });
                Ok(StartedRun {
                    task_id,
                    spawn_error: None,
                })
            }
            Err(e) => {
                tracing::error!(
                    task_id = %task_id,
                    error = %e,
                    "Automation process failed to start"
                );
                info.status = TaskStatus::Failed;
                info.ended_at = Some(Utc::now());
                info.last_error = Some(e.to_string());
                state.publish_lifecycle(&info);
                Ok(StartedRun {
                    task_id,
                    spawn_error: Some(e),
                })
            }
        }
    }

    fn cancel(
        &self,
        myself: ActorRef<SupervisorMsg>,
        state: &mut SupervisorState,
        reply: RpcReplyPort<()>,
    ) {
        let grace = state.config.grace_period;
        let Some(run) = state.active.as_mut() else {
            let _ = reply.send(());
            return;
        };
        run.cancel_waiters.push(reply);
        if run.cancel_requested {
            return;
        }
        run.cancel_requested = true;

        let delivered = run
            .pid
            .map(|pid| process::signal_group(pid, Signal::Terminate))
            .unwrap_or(false);
        if !delivered {
            run.kill.cancel();
            return;
        }

        tracing::info!(
            task_id = %run.info.id,
            grace_ms = grace.as_millis() as u64,
            "Cancelling automation task"
        );
        let task_id = run.info.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = myself.send_message(SupervisorMsg::GraceExpired { task_id });
        });
    }

    fn finish(
        &self,
        state: &mut SupervisorState,
        task_id: &str,
        exit_code: Option<i32>,
        signal: Option<i32>,
        error: Option<String>,
    ) {
        if state.active_for(task_id).is_none() {
            tracing::warn!(task_id = %task_id, "Ignoring exit of stale run");
            return;
        }
        let Some(run) = state.active.take() else {
            return;
        };
        let ActiveRun {
            mut info,
            cancel_requested,
            cancel_waiters,
            ..
        } = run;

        info.exit_code = exit_code;
        info.ended_at = Some(Utc::now());
        if exit_code == Some(0) {
            info.status = TaskStatus::Succeeded;
        } else if cancel_requested {
            info.status = TaskStatus::Cancelled;
            info.last_error = Some("cancelled by user".to_string());
        } else {
            info.status = TaskStatus::Failed;
            info.last_error = Some(match (error, signal, exit_code) {
                (Some(error), _, _) => error,
                (None, Some(signal), _) => format!("terminated by signal {signal}"),
                (None, None, Some(code)) => format!("exit code {code}"),
                (None, None, None) => "process exited without a status".to_string(),
            });
        }

        tracing::info!(
            task_id = %info.id,
            status = ?info.status,
            exit_code = ?info.exit_code,
            lines = info.lines_emitted,
            "Automation task finished"
        );
        state.publish_lifecycle(&info);
        for waiter in cancel_waiters {
            let _ = waiter.send(());
        }
    }
}
