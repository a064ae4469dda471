use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use tokio::sync::Mutex;
use tracing::info;

use super::{ClinicalDatabase, QueryRows, SqlValue};

/// SQLite-backed clinical store. The connection is shared behind a mutex;
/// rusqlite calls stay synchronous under the lock.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!("Opened clinical database at {}", path.display());
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Direct statement execution for seeding and maintenance.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl ClinicalDatabase for SqliteDatabase {
    fn dialect(&self) -> &str {
        "sqlite"
    }

    async fn list_tables(&self) -> Result<String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names.join(", "))
    }

    async fn table_schema(&self, tables: &[String]) -> Result<String> {
        let conn = self.conn.lock().await;
        let mut statements = Vec::new();

        if tables.is_empty() {
            let mut stmt = conn.prepare(
                "SELECT sql FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL \
                 ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                statements.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT sql FROM sqlite_master \
                 WHERE type = 'table' AND name = ?1 AND sql IS NOT NULL",
            )?;
            for table in tables {
                match stmt.query_row([table.as_str()], |row| row.get::<_, String>(0)) {
                    Ok(ddl) => statements.push(ddl),
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        tracing::warn!("No schema found for table '{}'", table);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(statements.join("\n\n"))
    }

    async fn run_query(&self, sql: &str) -> Result<QueryRows> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                record.push(match row.get_ref(i)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(v) => SqlValue::Integer(v),
                    ValueRef::Real(v) => SqlValue::Real(v),
                    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
                });
            }
            out.push(record);
        }

        Ok(QueryRows { columns, rows: out })
    }
}
