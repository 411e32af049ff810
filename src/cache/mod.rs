pub mod query_cache;

pub use query_cache::{CacheEntry, CacheStats, QueryCache};
