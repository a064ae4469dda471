pub mod sqlite;

pub use sqlite::SqliteDatabase;

use anyhow::Result;
use async_trait::async_trait;

/// One SQLite cell, kept typed so result rendering stays deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Literal rendering used when result rows are shown to the model.
    fn render(&self) -> String {
        match self {
            SqlValue::Null => "None".to_string(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Real(v) => v.to_string(),
            SqlValue::Text(v) => format!("'{}'", v.replace('\'', "\\'")),
            SqlValue::Blob(b) => format!("<blob {} bytes>", b.len()),
        }
    }
}

/// Result set of one read query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Render rows as a list of tuples, the textual shape the downstream
    /// formatting prompt expects, e.g. `[(24, 'Ibuprofen'), (31, 'Aspirin')]`.
    pub fn render_tuples(&self) -> String {
        let mut out = String::from("[");
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push('(');
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    out.push_str(", ");
                }
                out.push_str(&value.render());
            }
            // Single-element tuples keep the trailing comma.
            if row.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        out.push(']');
        out
    }
}

/// Read-only view over the clinical store: table listing, DDL retrieval and
/// query execution. Implementations decide the dialect.
#[async_trait]
pub trait ClinicalDatabase: Send + Sync {
    /// SQL dialect name surfaced to the query-writing prompt.
    fn dialect(&self) -> &str;

    /// Comma-separated names of the user tables.
    async fn list_tables(&self) -> Result<String>;

    /// CREATE TABLE statements for the named tables; all tables when empty.
    async fn table_schema(&self, tables: &[String]) -> Result<String>;

    async fn run_query(&self, sql: &str) -> Result<QueryRows>;
}
