use serde_json::Value;

use crate::error::{PersistError, Result};

/// Name of the mandatory primary-key field in every document.
pub const ID_FIELD: &str = "id";

/// Extracts the primary key from a document.
///
/// The document must be a mapping carrying a string `id` field.
pub fn document_id(doc: &Value) -> Result<&str> {
    let map = doc
        .as_object()
        .ok_or_else(|| PersistError::invalid_argument("document is not a mapping"))?;

    match map.get(ID_FIELD) {
        Some(Value::String(id)) => Ok(id),
        Some(_) => Err(PersistError::invalid_argument(
            "document `id` field is not a string",
        )),
        None => Err(PersistError::invalid_argument(
            "document has no `id` field",
        )),
    }
}

/// Splits a document into its primary key and an id-less payload.
///
/// The caller's value is left untouched; the id lives only in the primary-key
/// column, never duplicated inside the stored payload.
pub fn detach_id(doc: &Value) -> Result<(String, Value)> {
    let id = document_id(doc)?.to_string();

    let mut payload = doc.clone();
    if let Some(map) = payload.as_object_mut() {
        map.remove(ID_FIELD);
    }

    Ok((id, payload))
}

/// Reinserts the primary key into a payload loaded from storage.
///
/// Non-mapping values (e.g. count projections) pass through unchanged.
pub fn attach_id(mut payload: Value, id: &str) -> Value {
    if let Some(map) = payload.as_object_mut() {
        map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detach_and_attach_round_trip() {
        let doc = json!({"id": "u1", "name": "Ann", "age": 30});

        let (id, payload) = detach_id(&doc).unwrap();
        assert_eq!(id, "u1");
        assert_eq!(payload, json!({"name": "Ann", "age": 30}));
        // caller's document is untouched
        assert_eq!(doc["id"], "u1");

        assert_eq!(attach_id(payload, &id), doc);
    }

    #[test]
    fn rejects_missing_or_non_string_id() {
        assert!(matches!(
            document_id(&json!({"name": "Ann"})),
            Err(PersistError::InvalidArgument(_))
        ));
        assert!(matches!(
            document_id(&json!({"id": 42})),
            Err(PersistError::InvalidArgument(_))
        ));
        assert!(matches!(
            document_id(&json!([1, 2, 3])),
            Err(PersistError::InvalidArgument(_))
        ));
    }
}
