pub mod diagnostics;
pub mod doc_history;
pub mod doc_latest;
pub mod error;
pub mod health;
pub mod messages;
pub mod operation;
pub mod presence;
pub mod ready;

pub use diagnostics::*;
pub use doc_history::*;
pub use doc_latest::*;
pub use error::*;
pub use health::*;
pub use messages::*;
pub use operation::*;
pub use presence::*;
pub use ready::*;
