use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::models::WsHello;
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use execution_engine::notifier::UpdateStream;
use futures::{SinkExt, StreamExt};
use types::ids::UserId;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Response, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:ws_connections", user.user_id))?;

    // Subscribe before the upgrade so no update slips in between
    let updates = state.engine.notifier().subscribe().await?;
    let user_id = user.user_id;
    Ok(ws.on_upgrade(move |socket| relay_updates(socket, updates, user_id)))
}

/// Forward the user's own order updates until either side goes away.
async fn relay_updates(socket: WebSocket, mut updates: UpdateStream, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();

    let hello = WsHello {
        kind: "connected",
        user_id,
    };
    let Ok(hello) = serde_json::to_string(&hello) else {
        return;
    };
    if sender.send(Message::Text(hello.into())).await.is_err() {
        return;
    }
    tracing::debug!(%user_id, "Live update socket opened");

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(update) = update else { break };
                if update.user_id != user_id {
                    continue;
                }
                let text = match serde_json::to_string(&update) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode order update");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(%user_id, "Live update socket closed");
}
