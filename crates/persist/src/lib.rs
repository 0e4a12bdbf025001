//! Embeddable JSON document store with pluggable storage drivers.
//!
//! ```no_run
//! use persist::QueryParams;
//! use serde_json::json;
//!
//! let db = persist::open("/tmp/app.db", "sqlite", None)?;
//! let users = db.collection("users", true)?;
//!
//! users.save(&json!({"id": "u1", "name": "Ann", "age": 30}))?;
//! let ann = users.get("u1")?;
//! assert_eq!(ann["age"], 30);
//!
//! for doc in users.query(Some(&json!([["age", ">=", 30]])), QueryParams::new())? {
//!     println!("{}", doc?);
//! }
//! # Ok::<(), persist::PersistError>(())
//! ```

use std::path::Path;
use std::sync::Once;

use serde_json::Value;

pub use persist_core::*;

#[cfg(feature = "sqlite")]
pub use persist_driver_sqlite::SqliteDriver;

static INIT: Once = Once::new();

/// Registers the built-in drivers. Idempotent; called implicitly by
/// [`open`].
pub fn init() {
    INIT.call_once(|| {
        #[cfg(feature = "sqlite")]
        {
            use std::sync::Arc;
            register_driver(Arc::new(SqliteDriver::new()));
        }

        log::debug!("registered built-in drivers: {:?}", driver_names());
    });
}

/// Opens a database at `path` with the named driver, registering the
/// built-in drivers first.
pub fn open(path: impl AsRef<Path>, driver: &str, params: Option<&Value>) -> Result<Database> {
    init();
    Database::open(path, driver, params)
}
