pub mod cache;
pub mod model;
pub mod render;
pub mod selector;

pub use cache::SchemaCache;
pub use model::{ColumnInfo, SchemaSnapshot, TableInfo};
pub use selector::TableSelector;
