//! Observer WebSocket - streams relay events and accepts user input.
//!
//! Each connection owns one relay subscription and one writer task. Frames
//! are `{"event": <name>, "data": {...}}` in relay publish order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use shared_types::{ClientMessage, ServerEvent, StepKind, TaskStatus};
use tokio::sync::mpsc;

use crate::api::ApiState;
use crate::app_state::AppState;
use crate::dispatcher::Dispatched;
use crate::relay::CockpitEvent;

/// Observer-facing frames for one relay event.
pub fn wire_events(event: &CockpitEvent) -> Vec<ServerEvent> {
    match event {
        CockpitEvent::UserMessage { message } => vec![ServerEvent::UserMessage {
            message: message.clone(),
        }],
        CockpitEvent::ModeSwitched { mode } => vec![ServerEvent::ModeSwitched { mode: *mode }],
        CockpitEvent::ChatChunk { chunk, .. } => vec![ServerEvent::AiMessageChunk {
            chunk: chunk.clone(),
        }],
        CockpitEvent::ChatComplete { message, .. } => vec![ServerEvent::AiMessageComplete {
            message: message.clone(),
        }],
        CockpitEvent::TaskOutput(line) => vec![ServerEvent::AutoglmStep {
            kind: line.kind,
            content: line.text.clone(),
        }],
        CockpitEvent::TaskStep { kind, content } => vec![ServerEvent::AutoglmStep {
            kind: *kind,
            content: content.clone(),
        }],
        CockpitEvent::TaskLifecycle(run) => {
            let mut frames = vec![ServerEvent::TaskStatus { run: run.clone() }];
            let step = match run.status {
                TaskStatus::Succeeded => Some((StepKind::Finish, "任务执行完成".to_string())),
                TaskStatus::Failed => Some((
                    StepKind::Error,
                    run.last_error
                        .clone()
                        .unwrap_or_else(|| "任务执行失败".to_string()),
                )),
                TaskStatus::Cancelled => Some((StepKind::Error, "任务已取消".to_string())),
                TaskStatus::Idle | TaskStatus::Starting | TaskStatus::Running => None,
            };
            if let Some((kind, content)) = step {
                frames.push(ServerEvent::AutoglmStep { kind, content });
            }
            frames
        }
        CockpitEvent::Error { message } => vec![ServerEvent::Error {
            message: message.clone(),
        }],
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    let app_state = state.app_state.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, app_state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let connection_id = shared_types::new_id();
    let mut subscription = app_state.relay().subscribe(format!("ws:{connection_id}"));
    tracing::info!(
        connection_id = %connection_id,
        observers = app_state.relay().subscriber_count(),
        "Observer connected"
    );

    send_event(
        &tx,
        &ServerEvent::Status {
            message: "已连接到服务器".to_string(),
        },
    );
    send_event(
        &tx,
        &ServerEvent::TaskStatus {
            run: app_state.supervisor().status(),
        },
    );

    let tx_forward = tx.clone();
    let forward_id = connection_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            for frame in wire_events(&event) {
                if !send_event(&tx_forward, &frame) {
                    return;
                }
            }
        }
        tracing::warn!(
            connection_id = %forward_id,
            "Observer fell behind the event stream; closing"
        );
        send_event(
            &tx_forward,
            &ServerEvent::Error {
                message: "事件推送积压过多，连接已关闭".to_string(),
            },
        );
        let _ = tx_forward.send(Message::Close(None));
    });

    let dispatcher = app_state.dispatcher();
    let mut own_chats: Vec<String> = Vec::new();
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SendMessage { message }) => {
                    let dispatched = dispatcher.handle_message(&message).await;
                    if let Dispatched::Chat { request_id } = dispatched {
                        own_chats.retain(|id| dispatcher.chat_in_flight(id));
                        own_chats.push(request_id);
                    }
                }
                Ok(ClientMessage::SwitchMode { mode }) => {
                    dispatcher.handle_mode_switch(mode);
                }
                Ok(ClientMessage::CancelTask) => {
                    // Cancellation waits out the grace period; keep reading meanwhile.
                    let app_state = app_state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = app_state.dispatcher().cancel_task().await {
                            tracing::error!(error = %e, "Cancel request failed");
                        }
                    });
                }
                Ok(ClientMessage::Ping) => {
                    send_event(&tx, &ServerEvent::Pong);
                }
                Err(e) => {
                    send_event(
                        &tx,
                        &ServerEvent::Error {
                            message: format!("Invalid message: {e}"),
                        },
                    );
                }
            },
            Message::Close(_) => {
                break;
            }
            _ => {}
        }
    }

    for request_id in own_chats {
        dispatcher.abandon_chat(&request_id);
    }
    forward_task.abort();
    writer.abort();
    tracing::info!(connection_id = %connection_id, "Observer disconnected");
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => tx.send(Message::Text(text.into())).is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize WS event: {}", e);
            false
        }
    }
}
