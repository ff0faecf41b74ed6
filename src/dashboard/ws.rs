use super::{AppState, ManagedStatus};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

const PUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// Browsers cannot set headers on a WebSocket, so the token comes in the query.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    match state.authenticate(&query.token).await {
        Ok(auth) => ws.on_upgrade(move |socket| push_status(socket, state, auth.user.id)),
        Err(e) => super::ApiError(e).into_response(),
    }
}

async fn push_status(socket: WebSocket, state: AppState, user_id: i64) {
    let (mut sender, mut receiver) = socket.split();
    let mut ticker = tokio::time::interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status: ManagedStatus = state.manager.status(user_id).await;
                let text = match serde_json::to_string(&status) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to encode status: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("WebSocket for user {} closed", user_id);
}
