//! Document collaboration core: the operation log, the convergence engine,
//! presence tracking and the per-document coordinator actor.

pub mod convergence;
pub mod coordinator;
pub mod document;
pub mod oplog;
pub mod presence;
pub mod registry;

pub use convergence::{ConvergenceEngine, Resolution};
pub use coordinator::{CoordinatorState, CoordinatorStats, DocHandle, DocSnapshot, Outbound};
pub use document::{Document, Prepared};
pub use oplog::{Admission, Appended, OperationLog};
pub use presence::{PresenceTracker, SweepOutcome};
pub use registry::DocRegistry;
