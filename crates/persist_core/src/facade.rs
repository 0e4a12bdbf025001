use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{CATALOG_COLLECTION, CatalogEntry};
use crate::document::{attach_id, detach_id};
use crate::driver::{Backend, Cursor, found};
use crate::error::{PersistError, Result, ResultExt};
use crate::params::{QueryCallback, QueryParams};
use crate::registry::find_driver;
use crate::rules::Rule;

/// An open database handle.
///
/// Cheap to clone and sharable across threads; all clones refer to the same
/// backend. Collection handles are logical (a name plus a database
/// reference) and take no exclusive lock.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    path: PathBuf,
    driver_name: String,
    backend: Box<dyn Backend>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("driver", &self.inner.driver_name)
            .finish()
    }
}

impl Database {
    /// Opens a database at `path` using the driver registered under
    /// `driver_name`, creating the file and the collection catalog on first
    /// use.
    pub fn open(path: impl AsRef<Path>, driver_name: &str, params: Option<&Value>) -> Result<Self> {
        Self::open_inner(path.as_ref(), driver_name, params).record_err()
    }

    fn open_inner(path: &Path, driver_name: &str, params: Option<&Value>) -> Result<Self> {
        let driver = find_driver(driver_name).ok_or_else(|| {
            PersistError::not_found(format!("driver not found: {driver_name}"))
        })?;

        let backend = driver.open(path, params)?;

        // The catalog itself has no catalog row.
        backend.create_collection(CATALOG_COLLECTION)?;

        log::info!("opened database {} with driver {driver_name}", path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                path: path.to_path_buf(),
                driver_name: driver_name.to_string(),
                backend,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn driver_name(&self) -> &str {
        &self.inner.driver_name
    }

    /// Best-effort release of backend resources. Clones of this handle must
    /// not be used afterwards.
    pub fn close(&self) -> Result<()> {
        self.inner.backend.close().record_err()
    }

    fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    /// Returns a handle to the named collection.
    ///
    /// With `create` set, an absent collection is created (physical table
    /// plus catalog row); otherwise absence is a `not-found` error.
    pub fn collection(&self, name: &str, create: bool) -> Result<Collection> {
        self.collection_inner(name, create).record_err()
    }

    fn collection_inner(&self, name: &str, create: bool) -> Result<Collection> {
        validate_collection_name(name)?;

        match found(self.backend().get_object(CATALOG_COLLECTION, name))? {
            true => {}
            false if create => self.create_collection(name)?,
            false => {
                return Err(PersistError::not_found(format!(
                    "collection not found: {name}"
                )));
            }
        }

        Ok(Collection {
            db: self.clone(),
            name: name.to_string(),
        })
    }

    /// Creates the physical table and inserts the catalog row.
    fn create_collection(&self, name: &str) -> Result<()> {
        self.backend().create_collection(name)?;

        let entry = CatalogEntry::new().to_document()?;
        self.backend()
            .save_object(CATALOG_COLLECTION, name, &entry)?;

        log::debug!("created collection {name}");
        Ok(())
    }

    /// Catalog lookup only; never creates.
    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        found(self.backend().get_object(CATALOG_COLLECTION, name)).record_err()
    }

    /// Drops the physical table, removes the catalog row, and evicts any
    /// cached statements for the collection.
    pub fn remove_collection(&self, name: &str) -> Result<()> {
        self.remove_collection_inner(name).record_err()
    }

    fn remove_collection_inner(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;

        self.backend().destroy_collection(name)?;
        self.backend().delete_object(CATALOG_COLLECTION, name)?;

        log::debug!("removed collection {name}");
        Ok(())
    }

    /// Reads the user-defined metadata mapping from the catalog row.
    pub fn collection_metadata(&self, name: &str) -> Result<Value> {
        self.backend()
            .get_object(CATALOG_COLLECTION, name)
            .map(|doc| doc.get("metadata").cloned().unwrap_or(Value::Null))
            .record_err()
    }

    /// Replaces the metadata mapping; a read-modify-write on the catalog
    /// row.
    pub fn set_collection_metadata(&self, name: &str, metadata: &Value) -> Result<()> {
        self.set_collection_metadata_inner(name, metadata).record_err()
    }

    fn set_collection_metadata_inner(&self, name: &str, metadata: &Value) -> Result<()> {
        let mut doc = self.backend().get_object(CATALOG_COLLECTION, name)?;

        match doc.as_object_mut() {
            Some(map) => {
                map.insert("metadata".to_string(), metadata.clone());
            }
            None => {
                return Err(PersistError::internal(format!(
                    "catalog row for {name} is not a mapping"
                )));
            }
        }

        self.backend().save_object(CATALOG_COLLECTION, name, &doc)
    }

    /// Invokes `f` with every collection name in the catalog; stops early
    /// when `f` returns `false`.
    pub fn collections_apply(&self, mut f: impl FnMut(&str) -> bool) -> Result<()> {
        self.collections_apply_inner(&mut f).record_err()
    }

    fn collections_apply_inner(&self, f: &mut dyn FnMut(&str) -> bool) -> Result<()> {
        let mut cursor =
            self.backend()
                .query(CATALOG_COLLECTION, &[], &QueryParams::default())?;

        while let Some(row) = cursor.next_row()? {
            let Some(id) = row.id else { continue };
            if !f(&id) {
                break;
            }
        }

        Ok(())
    }

    pub fn start_transaction(&self) -> Result<()> {
        self.backend().begin_transaction().record_err()
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.backend().commit_transaction().record_err()
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.backend().rollback_transaction().record_err()
    }

    pub fn in_transaction(&self) -> Result<bool> {
        self.backend().in_transaction().record_err()
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PersistError::invalid_argument("collection name is empty"));
    }

    Ok(())
}

/// A handle to one named collection of documents.
#[derive(Clone)]
pub struct Collection {
    db: Database,
    name: String,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish()
    }
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn backend(&self) -> &dyn Backend {
        self.db.inner.backend.as_ref()
    }

    /// Fetches the document stored under `id`, with the id reattached to
    /// the returned mapping. Absent keys are `not-found`.
    pub fn get(&self, id: &str) -> Result<Value> {
        self.backend()
            .get_object(&self.name, id)
            .map(|payload| attach_id(payload, id))
            .record_err()
    }

    /// Saves a document with upsert semantics.
    ///
    /// The document must be a mapping with a string `id`; the id is
    /// detached from a copy of the payload and stored only in the
    /// primary-key column. The caller's value is not mutated.
    pub fn save(&self, doc: &Value) -> Result<()> {
        self.save_inner(doc).record_err()
    }

    fn save_inner(&self, doc: &Value) -> Result<()> {
        let (id, payload) = detach_id(doc)?;
        self.backend().save_object(&self.name, &id, &payload)
    }

    /// Saves every document in `docs`, stopping at the first failure.
    ///
    /// Not atomic by itself; wrap the call in an explicit transaction.
    pub fn save_many(&self, docs: &[Value]) -> Result<()> {
        self.save_many_inner(docs).record_err()
    }

    fn save_many_inner(&self, docs: &[Value]) -> Result<()> {
        let objects = docs
            .iter()
            .map(detach_id)
            .collect::<Result<Vec<_>>>()?;

        self.backend().save_objects(&self.name, &objects)
    }

    /// Deletes by primary key; deleting an absent key succeeds.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.backend().delete_object(&self.name, id).record_err()
    }

    /// Runs a filtered, optionally ordered and paginated query.
    ///
    /// `rules` is the wire-format rule tree (a sequence, implicitly
    /// conjoined); `None` selects everything.
    pub fn query(&self, rules: Option<&Value>, params: QueryParams) -> Result<DocumentIter> {
        self.query_inner(rules, params).record_err()
    }

    fn query_inner(&self, rules: Option<&Value>, params: QueryParams) -> Result<DocumentIter> {
        let parsed = parse_rules(rules)?;
        let callback = params.callback.clone();
        let cursor = self.backend().query(&self.name, &parsed, &params)?;

        Ok(DocumentIter {
            collection: self.name.clone(),
            cursor,
            callback,
            finished: false,
        })
    }

    /// Number of documents matching the rule tree.
    pub fn count(&self, rules: Option<&Value>) -> Result<u64> {
        let parsed = parse_rules(rules).record_err()?;
        self.backend().count(&self.name, &parsed).record_err()
    }

    /// Creates a secondary index over a dotted JSON path in the payload.
    pub fn add_index(&self, index_name: &str, path: &str) -> Result<()> {
        self.backend()
            .add_index(&self.name, index_name, path)
            .record_err()
    }

    pub fn drop_index(&self, index_name: &str) -> Result<()> {
        self.backend()
            .drop_index(&self.name, index_name)
            .record_err()
    }
}

fn parse_rules(rules: Option<&Value>) -> Result<Vec<Rule>> {
    match rules {
        Some(value) => Rule::parse_list(value),
        None => Ok(Vec::new()),
    }
}

/// Streaming iterator over query results.
///
/// Single forward pass, single consumer, not restartable; its lifetime is
/// bounded by the producing collection handle it carries.
pub struct DocumentIter {
    collection: String,
    cursor: Box<dyn Cursor>,
    callback: Option<QueryCallback>,
    finished: bool,
}

impl DocumentIter {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the next document, or `Ok(None)` at end of stream.
    ///
    /// A configured callback sees every document; when it returns `false`
    /// the iteration ends early.
    pub fn next_document(&mut self) -> Result<Option<Value>> {
        self.next_inner().record_err()
    }

    fn next_inner(&mut self) -> Result<Option<Value>> {
        if self.finished {
            return Ok(None);
        }

        let Some(row) = self.cursor.next_row()? else {
            self.finished = true;
            return Ok(None);
        };

        let doc = match row.id {
            Some(id) => attach_id(row.value, &id),
            None => row.value,
        };

        if let Some(callback) = &self.callback
            && !callback(&doc)
        {
            self.finished = true;
            return Ok(None);
        }

        Ok(Some(doc))
    }

    /// Drops the underlying cursor early.
    pub fn close(self) {}
}

impl Iterator for DocumentIter {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_document().transpose()
    }
}
