use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use persist_core::{PersistError, Result};
use rusqlite::Connection;

use crate::predicate::quote_ident;

/// The per-collection statement trio.
///
/// The strings are stable keys into the connection's prepared-statement
/// cache: re-preparing one of them returns the already-compiled statement.
#[derive(Debug)]
pub(crate) struct CollectionStatements {
    pub get: String,
    pub upsert: String,
    pub delete: String,
}

impl CollectionStatements {
    fn new(collection: &str) -> Self {
        let table = quote_ident(collection);

        Self {
            get: format!("SELECT id, value FROM {table} WHERE id = ?"),
            upsert: format!("INSERT OR REPLACE INTO {table} (id, value) VALUES (?, ?)"),
            delete: format!("DELETE FROM {table} WHERE id = ?"),
        }
    }
}

/// Per-collection cache of the get/upsert/delete statement set.
///
/// Entries are created on first access and evicted when the collection is
/// destroyed or the backend closes; eviction also flushes the connection's
/// prepared statements so nothing referencing a dropped table is reused.
pub(crate) struct StatementCache {
    entries: Mutex<HashMap<String, Arc<CollectionStatements>>>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the statement set for `collection`, preparing all three
    /// statements on a miss. A failed preparation leaves the cache without
    /// a half-populated entry.
    pub fn get_or_prepare(
        &self,
        conn: &Connection,
        collection: &str,
    ) -> Result<Arc<CollectionStatements>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get(collection) {
            return Ok(entry.clone());
        }

        let statements = CollectionStatements::new(collection);
        for sql in [&statements.get, &statements.upsert, &statements.delete] {
            conn.prepare_cached(sql).map_err(|err| {
                log::error!("failed to prepare statement for {collection}: {err}");
                PersistError::internal(err.to_string())
            })?;
        }

        let entry = Arc::new(statements);
        entries.insert(collection.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drops the entry for `collection` and its prepared statements.
    pub fn evict(&self, conn: &Connection, collection: &str) {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(collection);

        if removed.is_some() {
            conn.flush_prepared_statement_cache();
        }
    }

    pub fn clear(&self, conn: &Connection) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        conn.flush_prepared_statement_cache();
    }
}
