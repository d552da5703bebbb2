//! SQLite access for `db_query` assertions and extractions

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One result row, column name to value
pub type Row = Map<String, Value>;

/// Executes read queries on behalf of assertions and extractions
pub trait QueryBackend: Send + Sync {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

/// SQLite-backed query executor
#[derive(Clone)]
pub struct SqliteQuery {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQuery {
    /// Open database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!("Opened database at {:?}", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run setup statements, e.g. fixtures
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

impl QueryBackend for SqliteQuery {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!("db_query: {}", sql);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let bound = params.iter().map(to_sql).collect::<Result<Vec<_>>>()?;
        let mut rows = stmt.query(params_from_iter(bound))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), from_sql(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }
}

fn to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(serde_json::to_string(other).map_err(Error::from)?),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> SqliteQuery {
        let db = SqliteQuery::open_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL);
             INSERT INTO users (name, score) VALUES ('alice', 9.5), ('bob', NULL);",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_query_rows() {
        let db = fixture();
        let rows = db.query("SELECT id, name, score FROM users ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("alice"));
        assert_eq!(rows[0]["score"], json!(9.5));
        assert_eq!(rows[1]["score"], Value::Null);
    }

    #[test]
    fn test_query_params() {
        let db = fixture();
        let rows = db
            .query("SELECT COUNT(*) AS n FROM users WHERE name = ?1", &[json!("bob")])
            .unwrap();
        assert_eq!(rows[0]["n"], json!(1));
    }

    #[test]
    fn test_bad_sql() {
        let db = fixture();
        assert!(matches!(
            db.query("SELECT * FROM missing", &[]),
            Err(Error::Database(_))
        ));
    }
}
