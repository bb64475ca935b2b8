//! SQLite destination store.
//!
//! Tables are created on first write with a composite primary key; columns
//! that appear in later batches are added with `ALTER TABLE`. Replace uses
//! `INSERT OR REPLACE`, merge uses `ON CONFLICT ... DO UPDATE`.

use super::{key_indexes, DestinationStore, StoreError};
use crate::conflict::{ConflictStrategy, MergeRule};
use crate::rows::{CellKind, CellValue, RowChunk};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub struct SqliteStore {
    conn: Connection,
    in_transaction: bool,
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: CellKind) -> &'static str {
    match kind {
        CellKind::Integer | CellKind::Boolean => "INTEGER",
        CellKind::Float => "REAL",
        CellKind::Text => "TEXT",
    }
}

fn to_sql_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Integer(v) => Value::Integer(*v),
        CellValue::Float(v) => Value::Real(*v),
        CellValue::Text(v) => Value::Text(v.clone()),
        CellValue::Boolean(v) => Value::Integer(i64::from(*v)),
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            in_transaction: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn existing_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn ensure_table(
        &self,
        table: &str,
        primary_keys: &[String],
        chunk: &RowChunk,
    ) -> Result<(), StoreError> {
        if !self.table_exists(table)? {
            let cols: Vec<String> = chunk
                .columns
                .iter()
                .zip(&chunk.kinds)
                .map(|(c, k)| {
                    if primary_keys.contains(c) {
                        format!("{} {} NOT NULL", quote(c), sql_type(*k))
                    } else {
                        format!("{} {}", quote(c), sql_type(*k))
                    }
                })
                .collect();
            let keys: Vec<String> = primary_keys.iter().map(|k| quote(k)).collect();
            let ddl = format!(
                "CREATE TABLE {} ({}, PRIMARY KEY ({}))",
                quote(table),
                cols.join(", "),
                keys.join(", ")
            );
            debug!(table, "creating destination table");
            self.conn.execute_batch(&ddl)?;
            return Ok(());
        }

        let existing = self.existing_columns(table)?;
        for (column, kind) in chunk.columns.iter().zip(&chunk.kinds) {
            if !existing.contains(column) {
                debug!(table, column = %column, "adding column");
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote(table),
                    quote(column),
                    sql_type(*kind)
                ))?;
            }
        }
        Ok(())
    }

    fn insert_sql(
        table: &str,
        primary_keys: &[String],
        chunk: &RowChunk,
        conflict: &ConflictStrategy,
    ) -> String {
        let cols: Vec<String> = chunk.columns.iter().map(|c| quote(c)).collect();
        let placeholders: Vec<String> = (1..=chunk.columns.len()).map(|i| format!("?{i}")).collect();
        match conflict {
            ConflictStrategy::Replace => format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                quote(table),
                cols.join(", "),
                placeholders.join(", ")
            ),
            ConflictStrategy::Merge(policy) => {
                let assignments: Vec<String> = chunk
                    .columns
                    .iter()
                    .filter(|c| !primary_keys.contains(c))
                    .filter_map(|c| {
                        let q = quote(c);
                        match policy.rule(c)? {
                            MergeRule::KeepExisting => None,
                            MergeRule::TakeIncoming => Some(format!("{q} = excluded.{q}")),
                            MergeRule::TakeIncomingIfNotNull => {
                                Some(format!("{q} = COALESCE(excluded.{q}, {q})"))
                            }
                        }
                    })
                    .collect();
                let keys: Vec<String> = primary_keys.iter().map(|k| quote(k)).collect();
                let action = if assignments.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", assignments.join(", "))
                };
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
                    quote(table),
                    cols.join(", "),
                    placeholders.join(", "),
                    keys.join(", "),
                    action
                )
            }
        }
    }
}

impl DestinationStore for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            return Err(StoreError::TransactionInProgress);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn upsert(
        &mut self,
        table: &str,
        primary_keys: &[String],
        chunk: &RowChunk,
        conflict: &ConflictStrategy,
    ) -> Result<usize, StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        key_indexes(chunk, primary_keys)?;
        self.ensure_table(table, primary_keys, chunk)?;

        let sql = Self::insert_sql(table, primary_keys, chunk, conflict);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        for row in &chunk.rows {
            stmt.execute(params_from_iter(row.iter().map(to_sql_value)))?;
        }
        Ok(chunk.len())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        if self.conn.is_autocommit() {
            // SQLite already rolled back on its own
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}
