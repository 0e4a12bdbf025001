//! Driver-abstraction layer for an embeddable JSON document store.
//!
//! The façade presents collections of documents keyed by string id with
//! CRUD, filtered iteration, ordered paginated queries, secondary indexes,
//! and multi-write transactions. Persistence is delegated to pluggable
//! storage drivers looked up in a process-wide registry.

mod catalog;
mod document;
mod driver;
mod error;
mod facade;
mod params;
mod registry;
mod retry;
mod rules;

pub use catalog::{CATALOG_COLLECTION, CatalogEntry};
pub use document::{ID_FIELD, attach_id, detach_id, document_id};
pub use driver::{Backend, Cursor, Driver, RawRow, found};
pub use error::{ErrorCode, PersistError, Result, ResultExt, last_error, set_last_error};
pub use facade::{Collection, Database, DocumentIter};
pub use params::{QueryCallback, QueryParams};
pub use registry::{driver_names, find_driver, register_driver};
pub use retry::{BoundedRetry, FixedRetry, RetryPolicy};
pub use rules::{FieldOp, LogicalOp, Rule, field_json_text, rules_match};
