pub mod connctx;
pub mod handler;
pub mod msg_catchup_handler;
pub mod msg_heartbeat_handler;
pub mod msg_join_handler;
pub mod msg_leave_handler;
pub mod msg_op_handler;
pub mod msg_ping_handler;

pub use handler::websocket_handler;
