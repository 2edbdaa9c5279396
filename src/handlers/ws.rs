//! WebSocket upgrade endpoint: authenticate, register, then hand the socket to the hub.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::Credentials;
use crate::error::HubError;
use crate::hub::Hub;
use crate::{AppState, UserId};

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Rejects with 401 before upgrading when the caller cannot be authenticated. No connection
/// state exists for a rejected caller.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match authenticate(&state, q.token, &headers) {
        Ok(uid) => uid,
        Err(e) => {
            debug!(error = %e, "websocket upgrade rejected");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, hub))
}

fn authenticate(
    state: &AppState,
    token: Option<String>,
    headers: &HeaderMap,
) -> Result<UserId, HubError> {
    let credentials = Credentials::from_request(token, headers);
    Ok(state.auth.authenticate(&credentials)?)
}

async fn handle_socket(socket: WebSocket, user_id: UserId, hub: Hub) {
    let (conn, rx) = hub.connect(user_id);
    info!(user_id, conn_id = conn.conn_id(), "websocket upgraded");
    let (sink, stream) = socket.split();
    hub.serve(conn, rx, sink, stream).await;
}
