//! The storage layer: a single SQLite handle shared by the DAG, FTS,
//! artifact, and scheduler layers, each of which opens one transaction
//! per tool call so partial state is never observable.

pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::{EngineError, Result};

/// Owns the single database connection. Rusqlite's `Connection` is not
/// `Sync`, so a mutex serializes access the same way the store's own
/// write lock would under a real multi-threaded executor; the single-
/// writer invariant this engine assumes (see concurrency model) means
/// this never becomes a contended hot path.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        for stmt in schema::CREATE_TABLES {
            conn.execute_batch(stmt)?;
        }
        for stmt in schema::CREATE_CHUNKS_FTS_TRIGGERS {
            conn.execute_batch(stmt)?;
        }
        for stmt in schema::CREATE_FTS_CHUNKS_GATE_TRIGGERS {
            conn.execute_batch(stmt)?;
        }
        conn.execute_batch(schema::CREATE_FTS_MAINTENANCE_NO_DELETE_TRIGGER)?;
        conn.execute_batch(schema::SEED_FTS_MAINTENANCE)?;

        let existing_version: Option<i64> = conn
            .query_row("SELECT schema_version FROM meta WHERE id = 1", [], |row| {
                row.get(0)
            })
            .ok();
        match existing_version {
            Some(v) if v != schema::SCHEMA_VERSION => {
                return Err(EngineError::config(format!(
                    "schema version mismatch: db has {v}, engine expects {}",
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO meta (id, schema_version) VALUES (1, ?1)",
                    [schema::SCHEMA_VERSION],
                )?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a single all-or-nothing transaction. Commits on
    /// `Ok`, rolls back on `Err` (via `Transaction`'s `Drop`).
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::database("store mutex poisoned"))?;
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` with direct (non-transactional) read access, for queries
    /// that don't need write isolation (e.g. listing tasks).
    pub fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::database("store mutex poisoned"))?;
        f(&conn)
    }

    /// Flush the WAL and checkpoint on shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        self.read(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_creates_schema() {
        let store = Store::open_in_memory().unwrap();
        store
            .read(|conn| {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='commits'",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap();
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn seeds_fts_maintenance_disabled() {
        let store = Store::open_in_memory().unwrap();
        store
            .read(|conn| {
                let enabled: i64 = conn
                    .query_row("SELECT enabled FROM fts_maintenance WHERE id = 1", [], |r| {
                        r.get(0)
                    })
                    .unwrap();
                assert_eq!(enabled, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn fts_maintenance_delete_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let result = store.read(|conn| {
            conn.execute("DELETE FROM fts_maintenance WHERE id = 1", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn fts_maintenance_second_insert_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let result = store.read(|conn| {
            conn.execute(
                "INSERT INTO fts_maintenance (id, enabled) VALUES (1, 1)",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn fts_chunks_insert_rejected_while_gate_closed() {
        let store = Store::open_in_memory().unwrap();
        let result = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO trees (tree_hash, entries_json) VALUES ('t1', '[]')",
                [],
            )?;
            tx.execute(
                "INSERT INTO fts_chunks (tree_hash, chunk_id, text, content_hash) VALUES ('t1','c1','hello','h')",
                [],
            )?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn fts_chunks_insert_allowed_while_gate_open_and_mirrors_to_fts() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.execute("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1", [])?;
                tx.execute(
                    "INSERT INTO trees (tree_hash, entries_json) VALUES ('t1', '[]')",
                    [],
                )?;
                tx.execute(
                    "INSERT INTO fts_chunks (tree_hash, chunk_id, text, content_hash) VALUES ('t1','c1','hello world','h')",
                    [],
                )?;
                tx.execute("UPDATE fts_maintenance SET enabled = 0 WHERE id = 1", [])?;
                Ok(())
            })
            .unwrap();

        store
            .read(|conn| {
                let count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM fts_chunks_fts WHERE fts_chunks_fts MATCH 'hello'",
                        [],
                        |r| r.get(0),
                    )
                    .unwrap();
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn fts_chunks_update_always_rejected() {
        let store = Store::open_in_memory().unwrap();
        let result = store.transaction(|tx| {
            tx.execute("UPDATE fts_maintenance SET enabled = 1 WHERE id = 1", [])?;
            tx.execute(
                "INSERT INTO trees (tree_hash, entries_json) VALUES ('t1', '[]')",
                [],
            )?;
            tx.execute(
                "INSERT INTO fts_chunks (tree_hash, chunk_id, text, content_hash) VALUES ('t1','c1','hello','h')",
                [],
            )?;
            tx.execute("UPDATE fts_chunks SET text = 'changed' WHERE chunk_id = 'c1'", [])?;
            Ok(())
        });
        assert!(result.is_err());
    }
}
