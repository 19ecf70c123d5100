//! Observer WebSocket and HTTP API Integration Tests
//!
//! Starts the full router on an ephemeral port and talks to it the way the
//! web client does: JSON frames over `/ws` and the REST endpoints.

#![cfg(unix)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cockpit::api::{self, ApiState, HistoryResponse, StatusResponse};
use cockpit::app_state::AppState;
use cockpit::chat_backend::{ChatBackend, ChatError, ChatStream};
use cockpit::config::{AutomationConfig, Config};
use futures::stream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared_types::{ContextMessage, Mode, TaskStatus};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct EchoBackend;

#[async_trait]
impl ChatBackend for EchoBackend {
    async fn stream_chat(&self, messages: Vec<ContextMessage>) -> Result<ChatStream, ChatError> {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let chunks = vec![Ok("echo: ".to_string()), Ok(last)];
        Ok(stream::iter(chunks).boxed())
    }

    fn model(&self) -> &str {
        "echo"
    }
}

struct TestServer {
    addr: SocketAddr,
    app_state: AppState,
    _temp_dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.app_state.shutdown();
    }
}

async fn start_test_server(script: &str) -> TestServer {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    std::fs::write(temp_dir.path().join("agent.sh"), script).unwrap();

    let config = Config {
        automation: AutomationConfig {
            program: "sh".to_string(),
            script: PathBuf::from("agent.sh"),
            working_dir: temp_dir.path().to_path_buf(),
            required_files: Vec::new(),
            grace_period: Duration::from_secs(1),
            drain_timeout: Duration::from_millis(200),
        },
        ..Config::default()
    };

    let app_state = AppState::with_backend(config, Arc::new(EchoBackend))
        .await
        .expect("Failed to build app state");
    let app = api::router().with_state(ApiState {
        app_state: app_state.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        app_state,
        _temp_dir: temp_dir,
        handle,
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("Failed to connect");
    // greeting: status + current task snapshot
    assert_eq!(recv_json(&mut ws).await["event"], "status");
    assert_eq!(recv_json(&mut ws).await["event"], "task_status");
    ws
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Socket closed")
            .expect("Socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("Frame is not JSON");
        }
    }
}

/// Skip frames until one with `event` arrives.
async fn recv_event(ws: &mut WsStream, event: &str) -> Value {
    loop {
        let frame = recv_json(ws).await;
        if frame["event"] == event {
            return frame;
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send frame");
}

#[tokio::test]
async fn test_chat_message_round_trip() {
    let server = start_test_server("exit 0\n").await;
    let mut ws = connect(server.addr).await;

    send_json(&mut ws, json!({"event": "send_message", "data": {"message": "你好"}})).await;

    let frames = [
        recv_json(&mut ws).await,
        recv_json(&mut ws).await,
        recv_json(&mut ws).await,
        recv_json(&mut ws).await,
    ];
    assert_eq!(frames[0], json!({"event": "user_message", "data": {"message": "你好"}}));
    assert_eq!(frames[1], json!({"event": "ai_message_chunk", "data": {"chunk": "echo: "}}));
    assert_eq!(frames[2], json!({"event": "ai_message_chunk", "data": {"chunk": "你好"}}));
    assert_eq!(
        frames[3],
        json!({"event": "ai_message_complete", "data": {"message": "echo: 你好"}})
    );
}

#[tokio::test]
async fn test_mode_switch_reaches_every_observer() {
    let server = start_test_server("exit 0\n").await;
    let mut first = connect(server.addr).await;
    let mut second = connect(server.addr).await;

    send_json(&mut first, json!({"event": "switch_mode", "data": {"mode": "autoglm"}})).await;

    let expected = json!({"event": "mode_switched", "data": {"mode": "control"}});
    assert_eq!(recv_json(&mut first).await, expected);
    assert_eq!(recv_json(&mut second).await, expected);
    assert_eq!(server.app_state.mode().current(), Mode::Control);
}

#[tokio::test]
async fn test_control_task_streams_steps() {
    let server = start_test_server("sleep 0.2\necho '🤔 思考中: 找到设置图标'\necho '⚡ 执行动作: Tap'\nexit 0\n").await;
    let mut ws = connect(server.addr).await;
    server.app_state.mode().switch_to(Mode::Control);
    recv_event(&mut ws, "mode_switched").await;

    send_json(&mut ws, json!({"event": "send_message", "data": {"message": "打开设置"}})).await;

    let mut steps = Vec::new();
    loop {
        let frame = recv_json(&mut ws).await;
        if frame["event"] == "autoglm_step" {
            steps.push(frame["data"].clone());
        }
        if frame["event"] == "ai_message_complete" {
            assert_eq!(frame["data"]["message"], "✅ 任务完成: 打开设置");
            break;
        }
    }

    assert!(steps.contains(&json!({"type": "thinking", "content": "收到任务指令: 打开设置"})));
    assert!(steps.contains(&json!({"type": "thinking", "content": "🤔 思考中: 找到设置图标"})));
    assert!(steps.contains(&json!({"type": "action", "content": "⚡ 执行动作: Tap"})));
    assert_eq!(
        steps.last(),
        Some(&json!({"type": "finish", "content": "任务执行完成"}))
    );
}

#[tokio::test]
async fn test_ping_and_invalid_frames() {
    let server = start_test_server("exit 0\n").await;
    let mut ws = connect(server.addr).await;

    send_json(&mut ws, json!({"event": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await, json!({"event": "pong"}));

    ws.send(Message::Text("not json".into())).await.unwrap();
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["event"], "error");
    assert!(frame["data"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid message"));
}

#[tokio::test]
async fn test_disconnect_unsubscribes_observer() {
    let server = start_test_server("exit 0\n").await;
    let baseline = server.app_state.relay().subscriber_count();

    let mut ws = connect(server.addr).await;
    assert_eq!(server.app_state.relay().subscriber_count(), baseline + 1);
    ws.close(None).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while server.app_state.relay().subscriber_count() != baseline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("observer was not removed from the relay");
}

#[tokio::test]
async fn test_http_endpoints() {
    let server = start_test_server("echo started\nsleep 10\n").await;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let response = client
        .post(format!("{base}/api/mode"))
        .json(&json!({"mode": "control"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"mode": "control", "changed": true}));

    let response = client
        .post(format!("{base}/api/message"))
        .json(&json!({"message": "长任务"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let response = client
        .post(format!("{base}/api/message"))
        .json(&json!({"message": "第二个任务"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    let status: StatusResponse = client
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.mode, Mode::Control);
    assert_eq!(status.task.status, TaskStatus::Running);
    assert_eq!(status.task.instruction, "长任务");
    assert_eq!(status.device, "192.168.2.13:34333");
    assert_eq!(status.chat_model, "echo");

    let response = client
        .post(format!("{base}/api/task/cancel"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["task"]["status"], "cancelled");

    // outcome entry is appended by the dispatcher's watcher after the transition
    timeout(Duration::from_secs(5), async {
        while !server
            .app_state
            .history()
            .all(None)
            .iter()
            .any(|m| m.content == "⏹️ 任务已取消: 长任务")
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cancel outcome never reached history");

    let history: HistoryResponse = client
        .get(format!("{base}/api/history?limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.messages.len(), 2);

    let response = client
        .post(format!("{base}/api/history/clear"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(server.app_state.history().is_empty());

    let response = client
        .post(format!("{base}/api/message"))
        .json(&json!({"message": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
