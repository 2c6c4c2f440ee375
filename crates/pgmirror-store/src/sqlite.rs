use std::path::Path;

use pgmirror_core::{RelationDescriptor, Value};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::table::{quote_ident, LocalTable};

const STATEMENT_CACHE_CAPACITY: usize = 256;

/// Rows returned by a passthrough query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// One column of a local table as reported by SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalColumn {
    pub name: String,
    pub declared_type: String,
    pub primary_key: bool,
}

struct Param<'a>(&'a Value);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

/// The embedded local store. Not synchronized; callers serialize access.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open or create a store at the given path. `:memory:` opens an
    /// in-memory store.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if path == Path::new(":memory:") {
            return Self::in_memory();
        }
        info!(path = %path.display(), "Opening local store");
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(Self { conn })
    }

    /// Create the local table for a descriptor, replacing any table of the
    /// same name, and prepare its statements.
    pub fn create_table(&self, descriptor: &RelationDescriptor) -> StoreResult<LocalTable> {
        let table = LocalTable::new(descriptor);
        self.conn.execute(&table.drop_sql(), [])?;
        self.conn.execute(table.create_sql(), [])?;
        for sql in table.statements() {
            self.conn.prepare_cached(sql)?;
        }
        debug!(table = table.name(), "Created local table");
        Ok(table)
    }

    /// Drop a local table and release its prepared statements.
    pub fn drop_table(&self, table: &LocalTable) -> StoreResult<()> {
        self.drop_table_named(table.name())
    }

    pub fn drop_table_named(&self, name: &str) -> StoreResult<()> {
        self.conn.flush_prepared_statement_cache();
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
        debug!(table = name, "Dropped local table");
        Ok(())
    }

    /// Insert a full row, replacing any row with the same key.
    pub fn insert(&self, table: &LocalTable, values: &[Value]) -> StoreResult<usize> {
        check_arity(table, values.len())?;
        let mut stmt = self.conn.prepare_cached(table.insert_sql())?;
        Ok(stmt.execute(params_from_iter(values.iter().map(Param)))?)
    }

    /// Update the row identified by `key`. `None` entries are left untouched.
    pub fn update(
        &self,
        table: &LocalTable,
        values: &[Option<Value>],
        key: &[Value],
    ) -> StoreResult<usize> {
        check_arity(table, values.len())?;
        check_key_arity(table, key.len())?;

        let present: Vec<bool> = values.iter().map(Option::is_some).collect();
        if !present.iter().any(|p| *p) {
            return Err(StoreError::EmptyUpdate(table.name().to_string()));
        }

        let sql = table.update_sql(&present);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let params = values.iter().flatten().chain(key.iter()).map(Param);
        Ok(stmt.execute(params_from_iter(params))?)
    }

    pub fn delete(&self, table: &LocalTable, key: &[Value]) -> StoreResult<usize> {
        check_key_arity(table, key.len())?;
        let mut stmt = self.conn.prepare_cached(table.delete_sql())?;
        Ok(stmt.execute(params_from_iter(key.iter().map(Param)))?)
    }

    pub fn truncate(&self, table: &LocalTable) -> StoreResult<usize> {
        let mut stmt = self.conn.prepare_cached(table.truncate_sql())?;
        Ok(stmt.execute([])?)
    }

    /// Run an arbitrary read query with positional parameters.
    pub fn query(&self, sql: &str, params: &[Value]) -> StoreResult<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter().map(Param)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            out.push(values);
        }

        Ok(QueryResult { columns, rows: out })
    }

    /// Select rows of a local table, optionally filtered by a WHERE clause.
    pub fn query_table(
        &self,
        name: &str,
        where_clause: Option<&str>,
        params: &[Value],
    ) -> StoreResult<QueryResult> {
        let mut sql = format!("SELECT * FROM {}", quote_ident(name));
        if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(clause);
        }
        self.query(&sql, params)
    }

    /// Names of all user tables in the store.
    pub fn tables(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_schema WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Column layout of a local table.
    pub fn table_info(&self, name: &str) -> StoreResult<Vec<LocalColumn>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(LocalColumn {
                    name: row.get("name")?,
                    declared_type: row.get("type")?,
                    primary_key: row.get::<_, i64>("pk")? > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(StoreError::TableNotFound(name.to_string()));
        }
        Ok(columns)
    }

    /// Close the underlying connection.
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

fn check_arity(table: &LocalTable, actual: usize) -> StoreResult<()> {
    let expected = table.columns().len();
    if actual != expected {
        return Err(StoreError::Arity {
            table: table.name().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_key_arity(table: &LocalTable, actual: usize) -> StoreResult<()> {
    let expected = table.key_columns().len();
    if actual != expected {
        return Err(StoreError::Arity {
            table: table.name().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
