use tracing::info;

use crate::models::CatchupMessage;
use crate::websocket::connctx::ConnCtx;

/// Handle CatchupMessage
pub fn handle_catchup_message(catchup_msg: CatchupMessage, conn: &mut ConnCtx) {
    let joined = match conn.joined_to(&catchup_msg.doc_id) {
        Ok(joined) => joined,
        Err(e) => {
            conn.send_error(&e, None);
            return;
        }
    };

    info!(
        "Catch-up for document {} from version {} on connection {}",
        catchup_msg.doc_id, catchup_msg.since_version, conn.id
    );
    if let Err(e) = joined
        .handle
        .catch_up(conn.id, catchup_msg.since_version, conn.outbound.clone())
    {
        conn.forget();
        conn.send_error(&e, None);
    }
}
