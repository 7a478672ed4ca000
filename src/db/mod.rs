pub mod dbcolab;
pub mod memory;
pub mod store;

pub use dbcolab::DbColab;
pub use memory::MemoryOpStore;
pub use store::OpStore;
