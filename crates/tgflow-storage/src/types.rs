use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;

/// Primary key of a stored record.
///
/// Integers sort before text, matching SQLite's native ordering for mixed
/// key columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Extract a key from a JSON value (used for in-line `key_path` keys).
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Key::Text(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(Key::Int),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl ToSql for Key {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Key::Int(n) => Ok(ToSqlOutput::from(*n)),
            Key::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
        }
    }
}

impl FromSql for Key {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(n) => Ok(Key::Int(n)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Key::Text(s.to_string()))
                .map_err(|err| FromSqlError::Other(Box::new(err))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A contiguous key interval, in the spirit of `IDBKeyRange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Key>,
    pub upper: Bound<Key>,
}

impl KeyRange {
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: bound(lower.into(), lower_open),
            upper: bound(upper.into(), upper_open),
        }
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}

/// Range query over a store's primary key or one of its indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single write inside [`crate::Database::batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put {
        store: String,
        /// `None` means the key is read from the value at the store's `key_path`.
        key: Option<Key>,
        value: serde_json::Value,
        /// Absolute expiry in milliseconds since the Unix epoch.
        expires_at: Option<i64>,
    },
    Delete {
        store: String,
        key: Key,
    },
}

impl BatchOp {
    pub fn put(store: impl Into<String>, key: impl Into<Key>, value: serde_json::Value) -> Self {
        BatchOp::Put {
            store: store.into(),
            key: Some(key.into()),
            value,
            expires_at: None,
        }
    }

    /// Put a value whose key lives inside it at the store's `key_path`.
    pub fn put_inline(store: impl Into<String>, value: serde_json::Value) -> Self {
        BatchOp::Put {
            store: store.into(),
            key: None,
            value,
            expires_at: None,
        }
    }

    pub fn delete(store: impl Into<String>, key: impl Into<Key>) -> Self {
        BatchOp::Delete {
            store: store.into(),
            key: key.into(),
        }
    }

    /// Attach an absolute expiry (ms since epoch). No-op for deletes.
    pub fn expires_at(mut self, at_ms: i64) -> Self {
        if let BatchOp::Put { expires_at, .. } = &mut self {
            *expires_at = Some(at_ms);
        }
        self
    }

    pub fn store(&self) -> &str {
        match self {
            BatchOp::Put { store, .. } | BatchOp::Delete { store, .. } => store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_extract_from_strings_and_integers_only() {
        assert_eq!(Key::from_json(&json!("alice")), Some(Key::Text("alice".into())));
        assert_eq!(Key::from_json(&json!(42)), Some(Key::Int(42)));
        assert_eq!(Key::from_json(&json!(1.5)), None);
        assert_eq!(Key::from_json(&json!({"id": 1})), None);
    }

    #[test]
    fn integer_keys_sort_before_text() {
        let mut keys = vec![Key::from("b"), Key::from(10), Key::from("a"), Key::from(-3)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::Int(-3), Key::Int(10), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn expiry_only_applies_to_puts() {
        let del = BatchOp::delete("s", 1).expires_at(5);
        assert_eq!(del, BatchOp::delete("s", 1));
        let put = BatchOp::put("s", 1, json!(1)).expires_at(5);
        assert!(matches!(put, BatchOp::Put { expires_at: Some(5), .. }));
    }
}
