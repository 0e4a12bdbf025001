use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Reserved collection enumerating every user collection and its metadata.
pub const CATALOG_COLLECTION: &str = "__collections";

/// Catalog row stored in [`CATALOG_COLLECTION`], keyed by collection name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Creation time as unix seconds.
    pub created_at: i64,

    /// Applied migration identifiers, oldest first.
    #[serde(default)]
    pub migrations: Vec<Value>,

    /// User-defined metadata mapping.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CatalogEntry {
    pub fn new() -> Self {
        Self {
            created_at: chrono::Utc::now().timestamp(),
            migrations: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: &Value) -> Result<Self> {
        Ok(serde_json::from_value(doc.clone())?)
    }
}

impl Default for CatalogEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_document_shape() {
        let entry = CatalogEntry::new();
        let doc = entry.to_document().unwrap();

        assert!(doc["created_at"].is_i64());
        assert_eq!(doc["migrations"], json!([]));
        assert_eq!(doc["metadata"], json!({}));
    }

    #[test]
    fn missing_optional_fields_default() {
        let entry = CatalogEntry::from_document(&json!({"created_at": 1000})).unwrap();
        assert_eq!(entry.created_at, 1000);
        assert!(entry.migrations.is_empty());
        assert!(entry.metadata.is_empty());
    }
}
