mod file_store;
mod memory_query_cache;
mod memory_store;

pub use file_store::*;
pub use memory_query_cache::*;
pub use memory_store::*;
