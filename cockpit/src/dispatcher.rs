//! Dispatcher - routes inbound user text by the active mode.
//!
//! Chat-mode requests run on their own worker task and never wait on the
//! automation slot. Control-mode requests go through the TaskSupervisor;
//! their outcome comes back asynchronously on the supervisor's finished-run
//! channel and is folded into the conversation by a watcher task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use shared_types::{ChatMessage, ContextMessage, Mode, StepKind, TaskRunInfo, TaskStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat_backend::{ChatBackend, ChatError};
use crate::history::ConversationHistory;
use crate::mode::ModeState;
use crate::relay::{CockpitEvent, OutputRelay};
use crate::supervisor::{run_outcome, StartedRun, TaskError, TaskSupervisor};

/// What `handle_message` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Blank input
    Ignored,
    Chat { request_id: String },
    TaskStarted { task_id: String },
    Rejected(TaskError),
}

type ChatRequests = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct Dispatcher {
    mode: Arc<ModeState>,
    history: Arc<ConversationHistory>,
    supervisor: TaskSupervisor,
    relay: OutputRelay,
    backend: Arc<dyn ChatBackend>,
    context_window: usize,
    chat_requests: ChatRequests,
    outcome_watcher: Option<JoinHandle<()>>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(watcher) = &self.outcome_watcher {
            watcher.abort();
        }
    }
}

impl Dispatcher {
    /// Wire the dispatcher into the mode state and relay. Must be called from
    /// within a tokio runtime.
    pub fn new(
        mode: Arc<ModeState>,
        history: Arc<ConversationHistory>,
        supervisor: TaskSupervisor,
        relay: OutputRelay,
        backend: Arc<dyn ChatBackend>,
        context_window: usize,
    ) -> Self {
        {
            let relay = relay.clone();
            let history = history.clone();
            mode.on_change(move |switched| {
                history.append_log(format!("已切换到: {}", switched.display_name()), switched);
                relay.publish(CockpitEvent::ModeSwitched { mode: switched });
            });
        }

        let outcome_watcher = match supervisor.take_finished() {
            Some(finished) => Some(tokio::spawn(watch_task_outcomes(
                finished,
                relay.clone(),
                history.clone(),
            ))),
            None => {
                tracing::error!(
                    "Finished-run channel already taken; task outcomes will not be reported"
                );
                None
            }
        };

        Self {
            mode,
            history,
            supervisor,
            relay,
            backend,
            context_window,
            chat_requests: Arc::new(Mutex::new(HashMap::new())),
            outcome_watcher,
        }
    }

    /// Route one user message. Never blocks on the chat backend or on a
    /// running automation task.
    pub async fn handle_message(&self, text: &str) -> Dispatched {
        let text = text.trim();
        if text.is_empty() {
            return Dispatched::Ignored;
        }

        let mode = self.mode.current();
        self.history.append_user(text, mode);
        self.relay.publish(CockpitEvent::UserMessage {
            message: text.to_string(),
        });

        match mode {
            Mode::Chat => self.start_chat(),
            Mode::Control => self.start_task(text).await,
        }
    }

    fn start_chat(&self) -> Dispatched {
        let request_id = shared_types::new_id();
        let cancel = CancellationToken::new();
        lock(&self.chat_requests).insert(request_id.clone(), cancel.clone());

        let job = ChatJob {
            request_id: request_id.clone(),
            context: self.history.recent_context(self.context_window),
            cancel,
            backend: self.backend.clone(),
            history: self.history.clone(),
            relay: self.relay.clone(),
            requests: self.chat_requests.clone(),
        };
        tracing::debug!(
            request_id = %request_id,
            context = job.context.len(),
            "Dispatching chat request"
        );
        tokio::spawn(job.run());

        Dispatched::Chat { request_id }
    }

    async fn start_task(&self, text: &str) -> Dispatched {
        let announce = vec![
            CockpitEvent::ChatChunk {
                request_id: None,
                chunk: format!("🤖 开始执行任务: {text}\n"),
            },
            CockpitEvent::TaskStep {
                kind: StepKind::Thinking,
                content: format!("收到任务指令: {text}"),
            },
        ];
        match self.supervisor.launch(text, announce).await {
            Ok(StartedRun {
                task_id,
                spawn_error: None,
            }) => Dispatched::TaskStarted { task_id },
            // The Failed lifecycle event already reaches observers and the
            // outcome watcher.
            Ok(StartedRun {
                task_id,
                spawn_error: Some(e),
            }) => {
                tracing::info!(task_id = %task_id, error = %e, "Control task failed to spawn");
                Dispatched::Rejected(e)
            }
            Err(e) => {
                tracing::info!(error = %e, "Control message rejected");
                self.history.append_assistant(format!("❌ {e}"), Mode::Control);
                self.relay.publish(CockpitEvent::Error {
                    message: e.to_string(),
                });
                Dispatched::Rejected(e)
            }
        }
    }

    /// Switch the routing mode. Observers learn about it through the mode
    /// listener installed in `new`.
    pub fn handle_mode_switch(&self, mode: Mode) -> bool {
        self.mode.switch_to(mode)
    }

    pub async fn cancel_task(&self) -> Result<(), TaskError> {
        self.supervisor.cancel().await
    }

    /// Abandon an in-flight chat request. Returns false when it already
    /// finished.
    pub fn abandon_chat(&self, request_id: &str) -> bool {
        match lock(&self.chat_requests).remove(request_id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_chats(&self) -> usize {
        lock(&self.chat_requests).len()
    }

    pub fn chat_in_flight(&self, request_id: &str) -> bool {
        lock(&self.chat_requests).contains_key(request_id)
    }

    pub fn chat_model(&self) -> &str {
        self.backend.model()
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<ChatMessage> {
        self.history.all(limit)
    }

    pub fn clear_history(&self) {
        self.history.clear();
        tracing::info!("Conversation history cleared");
    }

    pub fn mode(&self) -> Mode {
        self.mode.current()
    }

    pub fn task_status(&self) -> TaskRunInfo {
        self.supervisor.status()
    }
}

fn lock(requests: &ChatRequests) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    requests
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Chat worker
// ============================================================================

struct ChatJob {
    request_id: String,
    context: Vec<ContextMessage>,
    cancel: CancellationToken,
    backend: Arc<dyn ChatBackend>,
    history: Arc<ConversationHistory>,
    relay: OutputRelay,
    requests: ChatRequests,
}

impl ChatJob {
    async fn run(self) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ChatError::StreamAbandoned),
            reply = self.stream_reply() => reply,
        };
        lock(&self.requests).remove(&self.request_id);

        match result {
            Ok(reply) => {
                tracing::debug!(
                    request_id = %self.request_id,
                    chars = reply.chars().count(),
                    "Chat reply complete"
                );
                self.history.append_assistant(reply.clone(), Mode::Chat);
                self.relay.publish(CockpitEvent::ChatComplete {
                    request_id: Some(self.request_id),
                    message: reply,
                });
            }
            Err(e) => {
                tracing::warn!(request_id = %self.request_id, error = %e, "Chat request failed");
                self.history.append_log(format!("❌ {e}"), Mode::Chat);
                self.relay.publish(CockpitEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn stream_reply(&self) -> Result<String, ChatError> {
        let mut stream = self.backend.stream_chat(self.context.clone()).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            reply.push_str(&chunk);
            self.relay.publish(CockpitEvent::ChatChunk {
                request_id: Some(self.request_id.clone()),
                chunk,
            });
        }
        Ok(reply)
    }
}

// ============================================================================
// Task outcome watcher
// ============================================================================

/// Assistant message summarising a finished run.
pub fn outcome_message(run: &TaskRunInfo) -> String {
    match (run.status, run_outcome(run)) {
        (TaskStatus::Cancelled, _) => format!("⏹️ 任务已取消: {}", run.instruction),
        (_, Ok(())) => format!("✅ 任务完成: {}", run.instruction),
        (_, Err(e)) => format!("❌ 任务失败: {e}"),
    }
}

async fn watch_task_outcomes(
    mut finished: mpsc::UnboundedReceiver<TaskRunInfo>,
    relay: OutputRelay,
    history: Arc<ConversationHistory>,
) {
    while let Some(run) = finished.recv().await {
        let message = outcome_message(&run);
        history.append_assistant(message.clone(), Mode::Control);
        relay.publish(CockpitEvent::ChatChunk {
            request_id: None,
            chunk: message.clone(),
        });
        relay.publish(CockpitEvent::ChatComplete {
            request_id: None,
            message,
        });
    }
    tracing::debug!("Task supervisor stopped; outcome watcher exiting");
}
