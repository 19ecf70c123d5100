//! Cockpit configuration.
//!
//! Values are resolved in three layers: built-in defaults, an optional TOML
//! file (`COCKPIT_CONFIG`, falling back to `./cockpit.toml` when present), and
//! `COCKPIT_*` environment variables, which win over both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_CONTEXT_WINDOW: usize = 10;
pub const DEFAULT_RELAY_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to
    pub host: String,
    pub port: u16,
    /// Allowed browser origins; empty means any origin
    pub cors_origins: Vec<String>,
    pub device: DeviceConfig,
    pub chat: ChatConfig,
    pub automation: AutomationConfig,
    /// Conversation history capacity (FIFO eviction beyond this)
    pub history_capacity: usize,
    /// Number of user/assistant messages sent to the chat backend as context
    pub context_window: usize,
    /// Per-observer event queue depth before a slow observer is evicted
    pub relay_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cors_origins: Vec::new(),
            device: DeviceConfig {
                ip: "192.168.2.13".to_string(),
                adb_port: 34333,
            },
            chat: ChatConfig::default(),
            automation: AutomationConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            context_window: DEFAULT_CONTEXT_WINDOW,
            relay_queue_capacity: DEFAULT_RELAY_QUEUE_CAPACITY,
        }
    }
}

/// Paired phone, shown on the status endpoint only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub ip: String,
    pub adb_port: u16,
}

impl DeviceConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.adb_port)
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    /// OpenAI-compatible base URL, without the `/chat/completions` suffix
    pub base_url: String,
    pub model: String,
    /// Upper bound on establishing the streaming response
    pub connect_timeout: Duration,
    /// Longest silence tolerated between two streamed chunks
    pub idle_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
            model: "glm-4".to_string(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// How the automation agent is launched: `<program> <script> --task <text>`.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub program: String,
    /// Entry script, relative paths resolve against `working_dir`
    pub script: PathBuf,
    pub working_dir: PathBuf,
    /// Files that must exist (relative to `working_dir`) before a run starts
    pub required_files: Vec<PathBuf>,
    /// Wait between SIGTERM and SIGKILL when cancelling
    pub grace_period: Duration,
    /// How long to keep reading output after the process has exited
    pub drain_timeout: Duration,
}

impl AutomationConfig {
    pub fn script_path(&self) -> PathBuf {
        resolve(&self.working_dir, &self.script)
    }

    pub fn required_paths(&self) -> Vec<PathBuf> {
        self.required_files
            .iter()
            .map(|p| resolve(&self.working_dir, p))
            .collect()
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            script: PathBuf::from("run_accessibility.sh"),
            working_dir: PathBuf::from("AutoGLM-phone"),
            required_files: vec![
                PathBuf::from(".env"),
                PathBuf::from("Open-AutoGLM/accessibility_main.py"),
            ],
            grace_period: DEFAULT_GRACE_PERIOD,
            drain_timeout: Duration::from_millis(500),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ============================================================================
// File layer
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server: FileServer,
    device: FileDevice,
    ai: FileAi,
    automation: FileAutomation,
    history: FileHistory,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileServer {
    host: Option<String>,
    port: Option<u16>,
    cors_origins: Option<Vec<String>>,
    relay_queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDevice {
    ip: Option<String>,
    adb_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileAi {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileAutomation {
    program: Option<String>,
    script: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    required_files: Option<Vec<PathBuf>>,
    grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileHistory {
    capacity: Option<usize>,
    context_window: Option<usize>,
}

impl FileConfig {
    fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("COCKPIT_CONFIG").ok().map(PathBuf::from);
        let path = match explicit {
            Some(path) => path,
            None => {
                let default = PathBuf::from("cockpit.toml");
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        Self::from_path(&path)
    }

    fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {e}", path.display()))
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let file = FileConfig::load()?;
        Self::from_layers(file)
    }

    /// Load from an explicit TOML file, still honouring env overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        Self::from_layers(FileConfig::from_path(path)?)
    }

    fn from_layers(file: FileConfig) -> anyhow::Result<Self> {
        let defaults = Config::default();
        let automation_defaults = defaults.automation;
        let chat_defaults = defaults.chat;

        let api_key = std::env::var("COCKPIT_AI_API_KEY")
            .or_else(|_| std::env::var("ZHIPUAI_API_KEY"))
            .ok()
            .or(file.ai.api_key)
            .filter(|key| !key.trim().is_empty());

        let grace_secs = env_parse(
            "COCKPIT_TASK_GRACE_SECS",
            file.automation
                .grace_period_secs
                .unwrap_or(automation_defaults.grace_period.as_secs()),
        )?;

        Ok(Self {
            host: env_str(
                "COCKPIT_HOST",
                file.server.host.as_deref().unwrap_or(&defaults.host),
            ),
            port: env_parse("COCKPIT_PORT", file.server.port.unwrap_or(defaults.port))?,
            cors_origins: env_csv(
                "COCKPIT_CORS_ORIGINS",
                file.server.cors_origins.unwrap_or_default(),
            ),
            device: DeviceConfig {
                ip: env_str(
                    "COCKPIT_DEVICE_IP",
                    file.device.ip.as_deref().unwrap_or(&defaults.device.ip),
                ),
                adb_port: env_parse(
                    "COCKPIT_DEVICE_ADB_PORT",
                    file.device.adb_port.unwrap_or(defaults.device.adb_port),
                )?,
            },
            chat: ChatConfig {
                api_key,
                base_url: env_str(
                    "COCKPIT_AI_BASE_URL",
                    file.ai.base_url.as_deref().unwrap_or(&chat_defaults.base_url),
                ),
                model: env_str(
                    "COCKPIT_AI_MODEL",
                    file.ai.model.as_deref().unwrap_or(&chat_defaults.model),
                ),
                connect_timeout: chat_defaults.connect_timeout,
                idle_timeout: Duration::from_secs(env_parse(
                    "COCKPIT_AI_IDLE_TIMEOUT_SECS",
                    file.ai
                        .idle_timeout_secs
                        .unwrap_or(chat_defaults.idle_timeout.as_secs()),
                )?),
            },
            automation: AutomationConfig {
                program: env_str(
                    "COCKPIT_AUTOMATION_PROGRAM",
                    file.automation
                        .program
                        .as_deref()
                        .unwrap_or(&automation_defaults.program),
                ),
                script: env_path(
                    "COCKPIT_AUTOMATION_SCRIPT",
                    file.automation.script.unwrap_or(automation_defaults.script),
                ),
                working_dir: env_path(
                    "COCKPIT_AUTOMATION_DIR",
                    file.automation
                        .working_dir
                        .unwrap_or(automation_defaults.working_dir),
                ),
                required_files: match std::env::var("COCKPIT_AUTOMATION_REQUIRED_FILES") {
                    Ok(raw) => split_csv(&raw).into_iter().map(PathBuf::from).collect(),
                    Err(_) => file
                        .automation
                        .required_files
                        .unwrap_or(automation_defaults.required_files),
                },
                grace_period: Duration::from_secs(grace_secs),
                drain_timeout: automation_defaults.drain_timeout,
            },
            history_capacity: env_parse(
                "COCKPIT_HISTORY_CAPACITY",
                file.history.capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
            )?
            .max(1),
            context_window: env_parse(
                "COCKPIT_CONTEXT_WINDOW",
                file.history.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW),
            )?,
            relay_queue_capacity: env_parse(
                "COCKPIT_RELAY_QUEUE",
                file.server
                    .relay_queue_capacity
                    .unwrap_or(DEFAULT_RELAY_QUEUE_CAPACITY),
            )?
            .max(1),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => split_csv(&raw),
        Err(_) => default,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
