use tracing::{debug, info};

use crate::models::LeaveMessage;
use crate::websocket::connctx::ConnCtx;

/// Handle LeaveMessage
pub fn handle_leave_message(leave_msg: LeaveMessage, conn: &mut ConnCtx) {
    if conn.joined_to(&leave_msg.doc_id).is_err() {
        debug!(
            "Ignoring leave for document {} on connection {} that never joined it",
            leave_msg.doc_id, conn.id
        );
        return;
    }
    if let Some(joined) = conn.leave() {
        info!("User {} left document {} on connection {}", joined.user_id, joined.doc_id, conn.id);
    }
}
