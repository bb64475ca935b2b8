//! Destination store abstraction.
//!
//! The writer only needs transactions, a keyed insert with conflict behavior,
//! and row counting. Implementations must make `rollback` after a failed
//! `begin`/`upsert` safe to call.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::conflict::ConflictStrategy;
use crate::rows::RowChunk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no transaction in progress")]
    NoTransaction,

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("primary-key column '{0}' missing from rows")]
    MissingKeyColumn(String),

    #[error("primary-key column '{column}' is null at row {row}")]
    NullKey { column: String, row: usize },

    #[error("table '{table}' is keyed on {existing:?}, not {requested:?}")]
    KeyMismatch {
        table: String,
        existing: Vec<String>,
        requested: Vec<String>,
    },

    #[error("store backend: {0}")]
    Backend(String),
}

/// Transactional, keyed destination for cleaned rows.
pub trait DestinationStore {
    fn begin(&mut self) -> Result<(), StoreError>;

    /// Insert `chunk` into `table`, resolving key conflicts per `conflict`.
    /// Returns the number of rows handed to the store.
    fn upsert(
        &mut self,
        table: &str,
        primary_keys: &[String],
        chunk: &RowChunk,
        conflict: &ConflictStrategy,
    ) -> Result<usize, StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the open transaction. A no-op when none is open.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Committed rows in `table`; zero if it does not exist.
    fn count_rows(&self, table: &str) -> Result<usize, StoreError>;
}

/// Positions of the key columns in `chunk`. Every key cell must be present
/// and non-null.
pub(crate) fn key_indexes(
    chunk: &RowChunk,
    primary_keys: &[String],
) -> Result<Vec<usize>, StoreError> {
    let idx = primary_keys
        .iter()
        .map(|k| {
            chunk
                .column_index(k)
                .ok_or_else(|| StoreError::MissingKeyColumn(k.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    for (row, values) in chunk.rows.iter().enumerate() {
        if let Some(pos) = idx.iter().position(|&i| values[i].is_null()) {
            return Err(StoreError::NullKey {
                column: primary_keys[pos].clone(),
                row,
            });
        }
    }
    Ok(idx)
}
