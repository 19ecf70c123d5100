//! Shared types between the cockpit server and its observers
//!
//! These types are used by both:
//! - the cockpit server (native Rust)
//! - web and desktop observers (TypeScript bindings via ts-rs)
//!
//! Serializable with serde for JSON over WebSocket/HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Routing
// ============================================================================

/// Routing mode for inbound user text.
///
/// `chat` sends text to the conversational backend, `control` hands it to the
/// device-automation agent. The legacy web client names (`normal`, `autoglm`)
/// are accepted on input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum Mode {
    #[default]
    #[serde(alias = "normal")]
    Chat,
    #[serde(alias = "autoglm")]
    Control,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Control => "control",
        }
    }

    /// Human-readable label used in log entries and status panels.
    pub fn display_name(&self) -> &'static str {
        match self {
            Mode::Chat => "💬 普通对话模式",
            Mode::Control => "🤖 手机控制模式",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "normal" => Ok(Mode::Chat),
            "control" | "autoglm" => Ok(Mode::Control),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Log,
}

impl MessageRole {
    /// Roles that are forwarded to the chat backend as context.
    pub fn is_conversational(&self) -> bool {
        matches!(self, MessageRole::User | MessageRole::Assistant)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Log => "log",
        }
    }
}

/// One entry of the conversation history. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
}

/// `{role, content}` pair sent to the chat backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub struct ContextMessage {
    pub role: MessageRole,
    pub content: String,
}

// ============================================================================
// Automation tasks
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum TaskStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Starting or Running: the slot is claimed.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running)
    }
}

/// Snapshot of one automation run. The process handle stays inside the
/// supervisor; observers only ever see this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, TS)]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub struct TaskRunInfo {
    pub id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
    pub lines_emitted: u64,
}

impl TaskRunInfo {
    /// Placeholder snapshot reported before any run has happened.
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Display classification for automation progress lines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum StepKind {
    Thinking,
    Action,
    Error,
    Result,
    Finish,
}

/// One line of automation output, numbered per run starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub struct OutputLine {
    pub task_id: String,
    pub seq: u64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: StepKind,
}

// ============================================================================
// WebSocket protocol
// ============================================================================

/// Frames sent by observers, `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum ClientMessage {
    SendMessage { message: String },
    SwitchMode { mode: Mode },
    CancelTask,
    Ping,
}

/// Frames pushed to observers, `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[ts(export, export_to = "../../cockpit/static/generated.ts")]
pub enum ServerEvent {
    UserMessage {
        message: String,
    },
    ModeSwitched {
        mode: Mode,
    },
    AiMessageChunk {
        chunk: String,
    },
    AiMessageComplete {
        message: String,
    },
    AutoglmStep {
        #[serde(rename = "type")]
        kind: StepKind,
        content: String,
    },
    Error {
        message: String,
    },
    Status {
        message: String,
    },
    TaskStatus {
        run: TaskRunInfo,
    },
    Pong,
}

/// Generate a fresh sortable identifier for runs and chat requests.
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ts_rs::Config;

    #[test]
    fn test_mode_accepts_legacy_names() {
        let mode: Mode = serde_json::from_value(json!("autoglm")).unwrap();
        assert_eq!(mode, Mode::Control);
        let mode: Mode = serde_json::from_value(json!("normal")).unwrap();
        assert_eq!(mode, Mode::Chat);
        assert_eq!(serde_json::to_value(Mode::Control).unwrap(), json!("control"));
        assert_eq!("AutoGLM".parse::<Mode>().unwrap(), Mode::Control);
        assert!("video".parse::<Mode>().is_err());
    }

    #[test]
    fn test_task_status_classes() {
        assert!(TaskStatus::Running.is_active());
        assert!(TaskStatus::Starting.is_active());
        assert!(!TaskStatus::Idle.is_active());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_server_event_wire_shape() {
        let step = ServerEvent::AutoglmStep {
            kind: StepKind::Thinking,
            content: "收到任务指令".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"event": "autoglm_step", "data": {"type": "thinking", "content": "收到任务指令"}})
        );

        let chunk = ServerEvent::AiMessageChunk {
            chunk: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"event": "ai_message_chunk", "data": {"chunk": "hi"}})
        );

        let switched = ServerEvent::ModeSwitched { mode: Mode::Chat };
        assert_eq!(
            serde_json::to_value(&switched).unwrap(),
            json!({"event": "mode_switched", "data": {"mode": "chat"}})
        );
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_value(
            json!({"event": "send_message", "data": {"message": "打开微信"}}),
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SendMessage {
                message: "打开微信".to_string()
            }
        );

        let msg: ClientMessage =
            serde_json::from_value(json!({"event": "switch_mode", "data": {"mode": "autoglm"}}))
                .unwrap();
        assert_eq!(msg, ClientMessage::SwitchMode { mode: Mode::Control });

        let msg: ClientMessage = serde_json::from_value(json!({"event": "cancel_task"})).unwrap();
        assert_eq!(msg, ClientMessage::CancelTask);
    }

    #[test]
    fn export_types() {
        let config = Config::default();
        Mode::export(&config).unwrap();
        MessageRole::export(&config).unwrap();
        ChatMessage::export(&config).unwrap();
        ContextMessage::export(&config).unwrap();
        TaskStatus::export(&config).unwrap();
        TaskRunInfo::export(&config).unwrap();
        StepKind::export(&config).unwrap();
        OutputLine::export(&config).unwrap();
        ClientMessage::export(&config).unwrap();
        ServerEvent::export(&config).unwrap();
    }
}
