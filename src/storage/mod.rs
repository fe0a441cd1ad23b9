pub mod engine;
pub mod memory;

pub use engine::PersistenceStore;
pub use memory::MemoryStore;
