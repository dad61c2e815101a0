//! The inbound peer RPC surface: the message endpoint, federation lookup and
//! the well-known service descriptor.

use crate::agent::{Agent, AgentError};
use crate::fsm::{FsmError, PeerMessage};
use crate::store::StoreError;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/starlight/message", post(handle_message))
        .route("/federation", get(handle_federation))
        .route("/.well-known/stellar.toml", get(handle_toml))
        .with_state(agent)
}

/// `POST /starlight/message`: 200 on accepted, 400 on malformed or rejected
/// proposals, 205 on non-retriable protocol errors (the caller's task basket
/// drops the message), 500 on transient failures (the caller retries).
async fn handle_message(State(agent): State<Arc<Agent>>, body: Bytes) -> StatusCode {
    let message: PeerMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    if message.channel_id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let channel_id = message.channel_id.clone();
    match agent.receive_peer_message(message).await {
        Ok(()) => StatusCode::OK,
        Err(e) if e.is_non_retriable() => {
            warn!("peer message for channel {channel_id}: {e}");
            StatusCode::RESET_CONTENT
        }
        Err(AgentError::Fsm(FsmError::InvalidProposal(e))) => {
            warn!("peer message for channel {channel_id}: {e}");
            StatusCode::BAD_REQUEST
        }
        Err(AgentError::Federation(e)) => {
            warn!("peer message for channel {channel_id}: {e}");
            StatusCode::BAD_REQUEST
        }
        Err(e) => {
            warn!("peer message for channel {channel_id}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// `GET /federation?type=name&q=<name>*<host>`
async fn handle_federation(
    State(agent): State<Arc<Agent>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if params.get("type").map(String::as_str) != Some("name") {
        return (StatusCode::NOT_IMPLEMENTED, "not implemented").into_response();
    }
    let lookup = agent.store().view::<_, StoreError>(|snap| {
        let username = snap.config()?.map(|c| c.username);
        let account = snap.primary_acct()?;
        Ok(username.zip(account))
    });
    let Ok(Some((username, account))) = lookup else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    let host = request_host(&headers);
    let q = params.get("q").cloned().unwrap_or_default();
    if q != format!("{username}*{host}") {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    Json(json!({
        "stellar_address": q,
        "account_id": account.address(),
    }))
    .into_response()
}

/// `GET /.well-known/stellar.toml`: a descriptor pointing peers at the
/// federation and starlight endpoints on this host.
async fn handle_toml(headers: HeaderMap) -> impl IntoResponse {
    let host = request_host(&headers);
    let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") { "http" } else { "https" };
    let body = format!(
        "\nFEDERATION_SERVER=\"{scheme}://{host}/federation\"\nSTARLIGHT_SERVER=\"{scheme}://{host}/\"\n"
    );
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
