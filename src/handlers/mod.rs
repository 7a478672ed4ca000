pub mod health;
pub mod doc_latest;
pub mod doc_history;
pub mod diagnostics;

pub use health::*;
pub use doc_latest::*;
pub use doc_history::*;
pub use diagnostics::*;
