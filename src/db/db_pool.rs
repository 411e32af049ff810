use crate::db::DbError;
use duckdb::Connection;
use r2d2::ManageConnection;
use std::sync::Mutex;

pub const IN_MEMORY: &str = ":memory:";

/// r2d2 manager for DuckDB. One root handle is opened up front and every
/// pooled connection is cloned from it, so they all share a single database
/// instance (required for `:memory:`, and keeps one file lock per process).
pub struct DuckDBConnectionManager {
    root: Mutex<Connection>,
}

impl DuckDBConnectionManager {
    pub fn new(connection_string: &str) -> Result<Self, duckdb::Error> {
        let root = if connection_string == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(connection_string)?
        };
        Ok(Self {
            root: Mutex::new(root),
        })
    }
}

impl ManageConnection for DuckDBConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.root
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .try_clone()
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub fn build_pool(
    connection_string: &str,
    pool_size: u32,
) -> Result<r2d2::Pool<DuckDBConnectionManager>, DbError> {
    let manager = DuckDBConnectionManager::new(connection_string)
        .map_err(|e| DbError::Connection(e.to_string()))?;
    r2d2::Pool::builder()
        .max_size(pool_size.max(1))
        .build(manager)
        .map_err(|e| DbError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_shares_one_database() {
        let pool = build_pool(IN_MEMORY, 2).unwrap();
        let a = pool.get().unwrap();
        a.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);")
            .unwrap();

        let b = pool.get().unwrap();
        let count: i64 = b.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 2);
    }
}
