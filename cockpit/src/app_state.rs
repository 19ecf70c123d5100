use std::sync::Arc;

use crate::chat_backend::{ChatBackend, OpenAiCompatibleBackend};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::history::ConversationHistory;
use crate::mode::ModeState;
use crate::relay::OutputRelay;
use crate::supervisor::{TaskError, TaskSupervisor};

/// Every long-lived cockpit service, built once at startup and shared with
/// the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    mode: Arc<ModeState>,
    history: Arc<ConversationHistory>,
    relay: OutputRelay,
    supervisor: TaskSupervisor,
    dispatcher: Dispatcher,
}

impl AppState {
    /// Build the services with the configured OpenAI-compatible chat backend.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let backend = OpenAiCompatibleBackend::new(config.chat.clone())
            .map_err(|e| anyhow::anyhow!("Failed to build chat backend: {e}"))?;
        if config.chat.api_key.is_none() {
            tracing::warn!(
                "No chat API key configured; chat mode will report the backend as unavailable"
            );
        }
        Self::with_backend(config, Arc::new(backend))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start task supervisor: {e}"))
    }

    pub async fn with_backend(
        config: Config,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Self, TaskError> {
        let mode = Arc::new(ModeState::default());
        let history = Arc::new(ConversationHistory::new(config.history_capacity));
        let relay = OutputRelay::new(config.relay_queue_capacity);
        let (supervisor, _supervisor_handle) =
            TaskSupervisor::spawn(config.automation.clone(), relay.clone()).await?;

        let dispatcher = Dispatcher::new(
            mode.clone(),
            history.clone(),
            supervisor.clone(),
            relay.clone(),
            backend,
            config.context_window,
        );

        tracing::info!(
            history_capacity = history.capacity(),
            context_window = config.context_window,
            relay_queue = config.relay_queue_capacity,
            automation_dir = %config.automation.working_dir.display(),
            "Cockpit services started"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                mode,
                history,
                relay,
                supervisor,
                dispatcher,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn mode(&self) -> &Arc<ModeState> {
        &self.inner.mode
    }

    pub fn history(&self) -> &Arc<ConversationHistory> {
        &self.inner.history
    }

    pub fn relay(&self) -> &OutputRelay {
        &self.inner.relay
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.inner.supervisor
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Stop the supervisor, killing a running automation process.
    pub fn shutdown(&self) {
        self.inner.supervisor.shutdown();
    }
}
