use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ChannelSink, ClientMessage, ServerMessage};
use crate::commands;
use crate::server::AppState;

/// Outbound half of a websocket connection: messages are queued onto an
/// mpsc pump; the pump task owns the socket writer.
struct WsSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[async_trait]
impl ChannelSink for WsSink {
    async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("websocket connection closed"))
    }

    async fn close(&self) {
        // Dropping the last sender ends the pump; nothing to do eagerly.
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Upgrade handler for `/ws/{session_id}`. Bearer token comes from the
/// `Authorization` header or, for browsers, a `token` query parameter.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let authed = crate::auth::check_bearer(&state.token, header_token)
        || crate::auth::check_bearer(&state.token, query.token.as_deref());
    if !authed {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.manager.exists(&session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    info!("Channel connected for session {}", session_id);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Outbound pump: everything the core sends goes through here.
    let pump = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize outbound message: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let sink: Arc<dyn ChannelSink> = Arc::new(WsSink { tx });
    // The connection follows `/reset` onto the successor session.
    let mut current_session = session_id;
    let mut entry = state.registry.register(&current_session, sink.clone());
    if let Err(e) = state.manager.touch(&current_session).await {
        debug!("failed to touch session {}: {e:#}", current_session);
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let parsed = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("unparseable client frame: {e}");
                let _ = sink
                    .send(ServerMessage::Error {
                        detail: format!("unparseable message: {e}"),
                    })
                    .await;
                continue;
            }
        };

        match parsed {
            ClientMessage::Message { content } => {
                match commands::execute_raw(
                    &state.manager,
                    &state.rules,
                    &state.registry,
                    &current_session,
                    &content,
                )
                .await
                {
                    Some(outcome) => {
                        if let Some(new_session) = &outcome.new_session {
                            state.registry.deregister(&current_session, &entry);
                            entry = state.registry.register(new_session, sink.clone());
                            current_session = new_session.clone();
                        }
                        let _ = sink.send(outcome.reply).await;
                    }
                    None => {
                        // Ordinary chat: run the agent turn off the read
                        // loop so approval responses keep flowing.
                        let runner = state.runner.clone();
                        let session = current_session.clone();
                        let turn_sink = sink.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                runner.run_turn(&session, &content, turn_sink.clone()).await
                            {
                                warn!("agent turn failed for session {}: {e:#}", session);
                                let _ = turn_sink
                                    .send(ServerMessage::Error {
                                        detail: format!("turn failed: {e:#}"),
                                    })
                                    .await;
                            }
                        });
                    }
                }
            }
            ClientMessage::ApprovalResponse {
                tool_call_id,
                approved,
            } => {
                if !entry.pending.resolve(&tool_call_id, approved) {
                    debug!(
                        "approval response for unknown tool_call_id {} on session {}",
                        tool_call_id, current_session
                    );
                }
            }
            ClientMessage::Command { name, args } => {
                let outcome = commands::execute(
                    &state.manager,
                    &state.rules,
                    &state.registry,
                    &current_session,
                    &name,
                    &args,
                )
                .await;
                if let Some(new_session) = &outcome.new_session {
                    state.registry.deregister(&current_session, &entry);
                    entry = state.registry.register(new_session, sink.clone());
                    current_session = new_session.clone();
                }
                let _ = sink.send(outcome.reply).await;
            }
        }
    }

    // Disconnect: unbind and cancel pending approvals so in-flight turns
    // observe `cancelled` at their next suspension.
    state.registry.deregister(&current_session, &entry);
    pump.abort();
    info!("Channel disconnected for session {}", current_session);
}
