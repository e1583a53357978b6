mod error;
mod memory;
pub mod models;
mod pool;
pub mod repositories;
mod store;

pub use error::*;
pub use memory::MemoryStore;
pub use pool::*;
pub use repositories::*;
pub use store::{compile_pattern, pattern_matches, KeyValueStore};
