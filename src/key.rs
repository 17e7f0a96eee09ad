//! Query Key Module
//!
//! Deterministic identifiers for cacheable reads.
//!
//! A key names the resource type, an optional owning scope and the query
//! parameters, e.g. `comments:tweet:42:limit:20:offset:0`. Identical logical
//! queries must always render to identical keys, so parameters are sorted by
//! name before rendering.

use std::collections::BTreeMap;
use std::fmt;

// == Query Key ==
/// Deterministic identifier for a cacheable query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(String);

impl QueryKey {
    /// Starts building a key for the given resource type (e.g. `"comments"`).
    pub fn builder(resource: impl Into<String>) -> QueryKeyBuilder {
        QueryKeyBuilder {
            resource: resource.into(),
            scope: None,
            params: BTreeMap::new(),
        }
    }

    /// The canonical string form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// == Query Key Builder ==
/// Builder accumulating the parts of a [`QueryKey`].
#[derive(Debug, Clone)]
pub struct QueryKeyBuilder {
    resource: String,
    scope: Option<(String, String)>,
    params: BTreeMap<String, String>,
}

impl QueryKeyBuilder {
    // == Scope ==
    /// Narrows the key to an owning resource, e.g. `.scope("tweet", id)`.
    pub fn scope(mut self, kind: impl Into<String>, id: impl fmt::Display) -> Self {
        self.scope = Some((kind.into(), id.to_string()));
        self
    }

    // == Param ==
    /// Adds a query parameter. Parameters are rendered sorted by name, so the
    /// order of `param` calls never changes the resulting key.
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    // == Build ==
    /// Renders the canonical key.
    pub fn build(self) -> QueryKey {
        let mut parts = vec![self.resource];
        if let Some((kind, id)) = self.scope {
            parts.push(kind);
            parts.push(id);
        }
        for (name, value) in self.params {
            parts.push(name);
            parts.push(value);
        }
        QueryKey(parts.join(":"))
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        let key = QueryKey::builder("comments")
            .scope("tweet", "42")
            .param("offset", 0)
            .param("limit", 20)
            .build();

        assert_eq!(key.as_str(), "comments:tweet:42:limit:20:offset:0");
    }

    #[test]
    fn test_identical_queries_produce_identical_keys() {
        let a = QueryKey::builder("comments")
            .scope("tweet", "42")
            .param("offset", 0)
            .build();
        let b = QueryKey::builder("comments")
            .scope("tweet", "42")
            .param("offset", 0)
            .build();

        assert_eq!(a, b);
    }

    #[test]
    fn test_param_order_does_not_change_key() {
        let a = QueryKey::builder("messages")
            .scope("conversation", "c1")
            .param("offset", 10)
            .param("limit", 50)
            .build();
        let b = QueryKey::builder("messages")
            .scope("conversation", "c1")
            .param("limit", 50)
            .param("offset", 10)
            .build();

        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_scopes_produce_distinct_keys() {
        let a = QueryKey::builder("comments").scope("tweet", "1").build();
        let b = QueryKey::builder("comments").scope("tweet", "2").build();

        assert_ne!(a, b);
    }

    #[test]
    fn test_key_without_scope_or_params() {
        let key = QueryKey::builder("notifications").build();
        assert_eq!(key.as_str(), "notifications");
    }
}
