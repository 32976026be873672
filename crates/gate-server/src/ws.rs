//! WebSocket handling for change notifications

use crate::auth::Session;
use crate::error::ApiResult;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use gate_sync::{parse_command, ClientCommand};

/// Marker sent when the caller's view of the cluster changed
const SYNC_MARKER: &str = "sync";

pub async fn interrupt(ws: WebSocketUpgrade, State(state): State<AppState>, session: Session) -> ApiResult<Response> {
    let quota = state.identity.quota(&session.user, Some(&session.tokens)).await?;
    let tenant = session.user.to_string();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, tenant, quota.pool)))
}

pub async fn handle_socket(mut socket: WebSocket, state: AppState, tenant: String, pool: Option<String>) {
    let mut subscription = match state.sync.register(&tenant, pool.as_deref()) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(%tenant, error = %e, "cannot register socket");
            return;
        }
    };
    tracing::debug!(%tenant, socket = subscription.id(), "sync socket open");

    loop {
        tokio::select! {
            signal = subscription.recv() => {
                if signal.is_none() || socket.send(Message::Text(SYNC_MARKER.into())).await.is_err() {
                    break;
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let result = match parse_command(&text) {
                            Ok(ClientCommand::Rate(rate)) => subscription.request_rate(rate).await.map(|_| ()),
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            let _ = socket.send(Message::Text(format!("error: {}", e))).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    tracing::debug!(%tenant, socket = subscription.id(), "sync socket closed");
}
