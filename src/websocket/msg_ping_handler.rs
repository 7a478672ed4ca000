use chrono::Utc;
use tracing::debug;

use crate::models::{PingMessage, PongMessage, ServerMessage};
use crate::websocket::connctx::ConnCtx;

/// Handle PingMessage
pub fn handle_ping_message(_ping_msg: PingMessage, conn: &ConnCtx) {
    // Reply with pong
    debug!("Ping message received on connection {}", conn.id);
    conn.send(ServerMessage::Pong(PongMessage {
        date: Utc::now().to_rfc3339(),
    }));
}
