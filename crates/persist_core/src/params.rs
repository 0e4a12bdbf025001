use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Per-row hook invoked while draining a query iterator.
///
/// Returning `false` ends the iteration early.
pub type QueryCallback = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Options recognized by [`query`](crate::Collection::query).
#[derive(Clone, Default)]
pub struct QueryParams {
    /// Equivalent to `limit = 1`; overrides any explicit limit.
    pub single: bool,

    /// Ignore the projection and produce a single integer.
    pub count: bool,

    /// Direction for `sort_field`.
    pub descending: bool,

    /// Dotted JSON path inside the payload to order by.
    pub sort_field: Option<String>,

    pub offset: Option<u64>,
    pub limit: Option<u64>,

    /// Optional per-row hook; see [`QueryCallback`].
    pub callback: Option<QueryCallback>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    pub fn counting(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn with_sort_field(mut self, field: impl Into<String>) -> Self {
        self.sort_field = Some(field.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_callback(mut self, callback: QueryCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl fmt::Debug for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryParams")
            .field("single", &self.single)
            .field("count", &self.count)
            .field("descending", &self.descending)
            .field("sort_field", &self.sort_field)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
