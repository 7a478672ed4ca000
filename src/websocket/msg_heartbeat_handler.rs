use crate::models::HeartbeatMessage;
use crate::websocket::connctx::ConnCtx;

/// Handle HeartbeatMessage
pub fn handle_heartbeat_message(heartbeat_msg: HeartbeatMessage, conn: &mut ConnCtx) {
    let joined = match conn.joined_to(&heartbeat_msg.doc_id) {
        Ok(joined) => joined,
        Err(e) => {
            conn.send_error(&e, None);
            return;
        }
    };
    if let Err(e) = joined.handle.heartbeat(conn.id) {
        conn.forget();
        conn.send_error(&e, None);
    }
}
