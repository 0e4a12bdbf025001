use std::path::Path;

use serde_json::Value;

use crate::error::{PersistError, Result};
use crate::params::QueryParams;
use crate::rules::Rule;

/// One row produced by a driver cursor.
///
/// `id` is `None` for count projections, where `value` is the integer.
#[derive(Debug, Clone)]
pub struct RawRow {
    pub id: Option<String>,
    pub value: Value,
}

/// Streaming handle over the rows selected by [`Backend::query`].
///
/// Single forward pass; dropping the cursor releases its statement.
pub trait Cursor: Send {
    /// Returns the next row, or `None` at end of stream.
    fn next_row(&mut self) -> Result<Option<RawRow>>;
}

/// Factory registered by name in the driver registry.
///
/// The factory validates configuration and opens backends; the backend
/// carries the open database state.
pub trait Driver: Send + Sync {
    /// Registry name, e.g. `"sqlite"`.
    fn name(&self) -> &'static str;

    /// Opens (creating if necessary) the database at `path`.
    fn open(&self, path: &Path, params: Option<&Value>) -> Result<Box<dyn Backend>>;
}

/// An open database; the contract every storage backend satisfies.
///
/// Implementations must be thread-safe: the façade shares one backend across
/// all collection handles and threads. All stateful operations record the
/// thread-local error on failure.
pub trait Backend: Send + Sync {
    /// Best-effort release of backend resources.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Creates the physical namespace for a collection. Must succeed if it
    /// already exists.
    fn create_collection(&self, name: &str) -> Result<()>;

    /// Drops the physical namespace and any cached statements for it.
    fn destroy_collection(&self, name: &str) -> Result<()>;

    /// Lists physical collection namespaces known to the backend.
    fn collections(&self) -> Result<Vec<String>>;

    fn add_index(&self, collection: &str, index_name: &str, path: &str) -> Result<()>;

    fn drop_index(&self, collection: &str, index_name: &str) -> Result<()>;

    /// Fetches the payload stored under `id`. Absent keys are `not-found`.
    fn get_object(&self, collection: &str, id: &str) -> Result<Value>;

    /// Stores `value` under `id` with upsert semantics. The payload must not
    /// carry the id; the façade detaches it beforehand.
    fn save_object(&self, collection: &str, id: &str, value: &Value) -> Result<()>;

    /// Bulk variant of [`save_object`](Backend::save_object); stops at the
    /// first failure. Callers wrap this in an explicit transaction.
    fn save_objects(&self, collection: &str, objects: &[(String, Value)]) -> Result<()> {
        for (id, value) in objects {
            self.save_object(collection, id, value)?;
        }

        Ok(())
    }

    /// Deletes by primary key. Absent keys are treated as success.
    fn delete_object(&self, collection: &str, id: &str) -> Result<()>;

    fn begin_transaction(&self) -> Result<()>;

    fn commit_transaction(&self) -> Result<()>;

    fn rollback_transaction(&self) -> Result<()>;

    fn in_transaction(&self) -> Result<bool>;

    /// Number of documents matching `rules` (implicitly conjoined).
    fn count(&self, collection: &str, rules: &[Rule]) -> Result<u64>;

    /// Opens a cursor over the documents matching `rules`, honoring the
    /// ordering and pagination in `params`.
    fn query(
        &self,
        collection: &str,
        rules: &[Rule],
        params: &QueryParams,
    ) -> Result<Box<dyn Cursor>>;
}

/// Maps an absent-key failure to `Ok(false)`; used for existence probes.
pub fn found(result: Result<Value>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(PersistError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
