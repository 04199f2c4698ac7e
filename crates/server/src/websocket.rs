use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use enroll_core::CourseEvent;

use crate::{
    protocol::{Command, ServerFrame},
    AppState,
};

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one streaming connection: the client authenticates, then manages
/// per-course subscriptions. Course updates are forwarded in publish order;
/// a client that lags re-fetches the classroom snapshot after reconnect.
async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<CourseEvent>(64);
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut student_id: Option<String> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("websocket error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let command: Command = match serde_json::from_str(&text) {
                            Ok(cmd) => cmd,
                            Err(e) => {
                                let frame = ServerFrame::Error {
                                    message: format!("invalid command: {e}"),
                                };
                                if send_frame(&mut sender, &frame).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        let frame = handle_command(
                            command,
                            &app_state,
                            &mut student_id,
                            &mut subscriptions,
                            &event_tx,
                        );
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = event_rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("failed to serialize course event: {e}"),
                }
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
}

fn handle_command(
    command: Command,
    app_state: &Arc<AppState>,
    student_id: &mut Option<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    event_tx: &mpsc::Sender<CourseEvent>,
) -> ServerFrame {
    match command {
        Command::Authenticate { student_id: id } => {
            tracing::debug!(student_id = %id, "streaming client authenticated");
            *student_id = Some(id.clone());
            ServerFrame::Authenticated { student_id: id }
        }
        Command::SubscribeCourse { course_id } => {
            if student_id.is_none() {
                return ServerFrame::Error {
                    message: "authenticate before subscribing".to_string(),
                };
            }
            if subscriptions.contains_key(&course_id) {
                return ServerFrame::Subscribed { course_id };
            }

            let mut rx = app_state.service.events().subscribe(&course_id);
            let tx = event_tx.clone();
            let topic = course_id.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            // Dropped events are recovered via snapshot
                            // queries on the client side.
                            tracing::warn!(topic = %topic, skipped, "subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            subscriptions.insert(course_id.clone(), handle);
            ServerFrame::Subscribed { course_id }
        }
        Command::UnsubscribeCourse { course_id } => {
            if let Some(handle) = subscriptions.remove(&course_id) {
                handle.abort();
            }
            ServerFrame::Unsubscribed { course_id }
        }
    }
}

async fn send_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!("failed to serialize frame: {e}");
            Ok(())
        }
    }
}
