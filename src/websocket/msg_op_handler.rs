use tracing::{debug, warn};

use crate::models::{OpMessage, Operation};
use crate::websocket::connctx::ConnCtx;

/// Handle OpMessage
pub fn handle_op_message(op_msg: OpMessage, conn: &mut ConnCtx) {
    let joined = match conn.joined_to(&op_msg.doc_id) {
        Ok(joined) => joined,
        Err(e) => {
            warn!(
                "Operation {} for document {} arrived on connection {} without a matching join",
                op_msg.op_id, op_msg.doc_id, conn.id
            );
            conn.send_error(&e, Some(op_msg.op_id));
            return;
        }
    };

    debug!(
        "Operation {} on document {} at base version {}",
        op_msg.op_id, op_msg.doc_id, op_msg.base_version
    );
    let op = Operation {
        op_id: op_msg.op_id,
        doc_id: op_msg.doc_id,
        author_id: joined.user_id.clone(),
        base_version: op_msg.base_version,
        payload: op_msg.payload,
        timestamp: op_msg.timestamp,
    };
    if let Err(e) = joined.handle.submit(conn.id, op, conn.outbound.clone()) {
        conn.forget();
        conn.send_error(&e, Some(op_msg.op_id));
    }
}
