//! Client transport: a reconnecting WebSocket session bound to one document.

pub mod backoff;
pub mod session;

pub use backoff::Backoff;
pub use session::{Session, SessionConfig, SessionState};
