mod sessions_api;

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::AgentRunner;
use crate::channel::ws::ws_handler;
use crate::channel::ConnectionRegistry;
use crate::rules::RuleStore;
use crate::session::SessionManager;

use sessions_api::{create_session, delete_session, get_history, list_sessions};

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub rules: Arc<RuleStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub runner: Arc<AgentRunner>,
    pub token: String,
}

/// Bind the listener separately from serving so startup can map a bind
/// failure to its own exit code.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(format!("{}:{}", host, port)).await
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let control = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/sessions/{id}/history", get(get_history))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth));

    // The websocket route authenticates inside the handler: browsers cannot
    // set headers on an upgrade, so a query token is also accepted there.
    let app = Router::new()
        .merge(control)
        .route("/ws/{session_id}", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("Server running on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !crate::auth::check_bearer(&state.token, presented) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}
