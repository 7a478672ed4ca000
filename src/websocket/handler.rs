use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{ClientMessage, ServerMessage};
use crate::websocket::connctx::ConnCtx;
use crate::websocket::msg_catchup_handler::handle_catchup_message;
use crate::websocket::msg_heartbeat_handler::handle_heartbeat_message;
use crate::websocket::msg_join_handler::handle_join_message;
use crate::websocket::msg_leave_handler::handle_leave_message;
use crate::websocket::msg_op_handler::handle_op_message;
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::AppState;

/// WebSocket handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(app_state): State<Arc<AppState>>) -> Response {
    debug!("New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    info!("WebSocket connection established with connection_id: {}", connection_id);

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Everything destined for this client, coordinator output included, goes
    // through one queue so the client sees it in order.
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode message for connection {}: {}", connection_id, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut conn = ConnCtx::new(connection_id, outbound);
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => dispatch(&text, &mut conn, &app_state).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    conn.send_error(&SyncError::InvalidMessage("binary frames are not supported".to_string()), None);
                }
                // Ping/pong frames are answered by axum.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("WebSocket error on connection {}: {}", connection_id, e);
                    break;
                }
            },
            _ = &mut send_task => break,
        }
    }

    // Detach before the queue closes so the coordinator stops writing to it.
    drop(conn);
    send_task.abort();
    info!("WebSocket connection {} terminated", connection_id);
}

/// Decode one text frame and hand it to its message handler
async fn dispatch(text: &str, conn: &mut ConnCtx, app_state: &AppState) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to parse message on connection {}: {}", conn.id, e);
            conn.send_error(&SyncError::InvalidMessage(e.to_string()), None);
            return;
        }
    };

    match message {
        ClientMessage::Join(join_msg) => handle_join_message(join_msg, conn, &app_state.registry).await,
        ClientMessage::Op(op_msg) => handle_op_message(op_msg, conn),
        ClientMessage::Catchup(catchup_msg) => handle_catchup_message(catchup_msg, conn),
        ClientMessage::Heartbeat(heartbeat_msg) => handle_heartbeat_message(heartbeat_msg, conn),
        ClientMessage::Leave(leave_msg) => handle_leave_message(leave_msg, conn),
        ClientMessage::Ping(ping_msg) => handle_ping_message(ping_msg, conn),
    }
}
