//! Statements, bound values and result sets
//!
//! The coordinator never inspects SQL text. It only needs a statement's text
//! and bound parameters to schedule it, derive an identity for the deferred
//! queue, and key the scoped query cache.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Short type tag used in statement signatures
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int32(_) => "int32",
            DatabaseValue::Int64(_) => "int64",
            DatabaseValue::Float32(_) => "float32",
            DatabaseValue::Float64(_) => "float64",
            DatabaseValue::String(_) => "string",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::Uuid(_) => "uuid",
            DatabaseValue::DateTime(_) => "datetime",
            DatabaseValue::Date(_) => "date",
            DatabaseValue::Time(_) => "time",
            DatabaseValue::Json(_) => "json",
        }
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

/// Identity of a deferred statement
///
/// Two statements with the same key are the same logical write: the later
/// one replaces the earlier one in a deduplicating queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementKey(String);

impl StatementKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A statement text with its ordered bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Sql {
    pub text: String,
    pub params: Vec<DatabaseValue>,
    key: Option<StatementKey>,
}

impl Sql {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            key: None,
        }
    }

    pub fn with_params(text: impl Into<String>, params: Vec<DatabaseValue>) -> Self {
        Self {
            text: text.into(),
            params,
            key: None,
        }
    }

    /// Append a bound parameter
    pub fn bind(mut self, value: impl Into<DatabaseValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Override the derived identity with an explicit one
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.key = Some(StatementKey::new(key));
        self
    }

    /// Statement identity: the explicit key, or the text plus the parameter
    /// type signature. Parameter values are not part of the identity.
    pub fn key(&self) -> StatementKey {
        if let Some(key) = &self.key {
            return key.clone();
        }
        let signature = self
            .params
            .iter()
            .map(|p| p.type_name())
            .collect::<Vec<_>>()
            .join(",");
        StatementKey(format!("{}|{}", self.text, signature))
    }

    /// Text plus the tagged parameter values, used to key cached reads
    pub fn cache_key(&self) -> String {
        format!("{}|{:?}", self.text, self.params)
    }
}

impl From<&str> for Sql {
    fn from(text: &str) -> Self {
        Sql::new(text)
    }
}

/// Rows returned by a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DatabaseValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DatabaseValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a column value from a row by column name
    pub fn get(&self, row: usize, column: &str) -> Option<&DatabaseValue> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ignores_parameter_values() {
        let a = Sql::new("UPDATE users SET name = $1 WHERE id = $2").bind("alice").bind(1);
        let b = Sql::new("UPDATE users SET name = $1 WHERE id = $2").bind("bob").bind(1);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "UPDATE users SET name = $1 WHERE id = $2|string,int32");
    }

    #[test]
    fn test_key_distinguishes_parameter_types() {
        let a = Sql::new("INSERT INTO t VALUES ($1)").bind(1);
        let b = Sql::new("INSERT INTO t VALUES ($1)").bind(1i64);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_explicit_key_overrides_signature() {
        let a = Sql::new("INSERT INTO t VALUES ($1)").bind(1).keyed("row-1");
        let b = Sql::new("INSERT INTO t VALUES ($1)").bind(2).keyed("row-2");
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "row-1");
    }

    #[test]
    fn test_cache_key_includes_values() {
        let a = Sql::new("SELECT * FROM users WHERE id = $1").bind(1);
        let b = Sql::new("SELECT * FROM users WHERE id = $1").bind(2);
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), Sql::new("SELECT * FROM users WHERE id = $1").bind(1).cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_value_types() {
        let int32 = Sql::new("SELECT $1").bind(1);
        let int64 = Sql::new("SELECT $1").bind(1i64);
        assert_ne!(int32.cache_key(), int64.cache_key());

        let text = Sql::new("SELECT $1").bind("x");
        let json = Sql::new("SELECT $1").bind(DatabaseValue::Json(JsonValue::String("x".to_string())));
        assert_ne!(text.cache_key(), json.cache_key());

        let single = Sql::new("SELECT $1").bind(DatabaseValue::Float32(1.5));
        let double = Sql::new("SELECT $1").bind(DatabaseValue::Float64(1.5));
        assert_ne!(single.cache_key(), double.cache_key());
    }

    #[test]
    fn test_result_set_lookup() {
        let rs = ResultSet::new(
            vec!["id".to_string(), "name".to_string()],
            vec![vec![DatabaseValue::Int32(7), DatabaseValue::from("alice")]],
        );
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.get(0, "name"), Some(&DatabaseValue::String("alice".to_string())));
        assert_eq!(rs.get(0, "missing"), None);
        assert_eq!(rs.get(1, "id"), None);
    }
}
