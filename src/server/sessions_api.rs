use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AppState;

#[derive(Deserialize, Default)]
pub(crate) struct CreateSessionRequest {
    #[serde(default)]
    channel_type: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    channel_type: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct SessionListItem {
    session_id: String,
    channel_type: String,
    last_active: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct HistoryItem {
    role: &'static str,
    #[serde(flatten)]
    entry: crate::session::HistoryEntry,
}

pub(crate) async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.list() {
        Ok(sessions) => {
            let items: Vec<SessionListItem> = sessions
                .into_iter()
                .filter(|s| !s.retired)
                .map(|s| SessionListItem {
                    session_id: s.session_id,
                    channel_type: s.channel_type,
                    last_active: s.last_active,
                })
                .collect();
            Json(items).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub(crate) async fn create_session(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // The body is optional; an empty POST creates a web session.
    let req: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("invalid body: {e}")).into_response()
            }
        }
    };
    let channel_type = match req.channel_type.as_deref() {
        None => "web",
        Some("web") => "web",
        Some("cli") => "cli",
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unsupported channel_type: {other}"),
            )
                .into_response()
        }
    };
    match state.manager.create(channel_type, None).await {
        Ok(session) => Json(CreateSessionResponse {
            session_id: session.session_id,
            channel_type: session.channel_type,
            created_at: session.created_at,
        })
        .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub(crate) async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.delete(&id).await {
        Ok(true) => {
            if let Some(entry) = state.registry.get(&id) {
                entry.sink.close().await;
            }
            state.registry.remove(&id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub(crate) async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if !state.manager.exists(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.manager.store().read_history(&id) {
        Ok(entries) => {
            let items: Vec<HistoryItem> = entries
                .into_iter()
                .map(|entry| HistoryItem {
                    role: entry.role(),
                    entry,
                })
                .collect();
            Json(items).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
