//! SQLite storage driver.
//!
//! Maps the document model onto one table per collection
//! (`id TEXT PRIMARY KEY, value TEXT` with canonical JSON in `value`),
//! lowers rule trees to `WHERE` fragments over SQLite's JSON functions, and
//! serves CRUD through a per-collection prepared-statement cache with a
//! busy-retry loop suitable for many threads over the single-writer engine.

mod driver;
mod predicate;
mod statement_cache;

pub use driver::{LOGGING_ENV, SqliteBackend, SqliteDriver};
