//! In-memory destination store for tests and dry runs.
//!
//! A transaction works on a copy of the committed tables; commit swaps it in,
//! rollback drops it.

use super::{key_indexes, DestinationStore, StoreError};
use crate::conflict::{ConflictStrategy, MergeRule};
use crate::rows::{CellValue, RowChunk};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type Row = BTreeMap<String, CellValue>;

/// One key cell, compared by type and value. Floats compare by bit pattern
/// with negative zero folded into zero.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyCell {
    Integer(i64),
    Float(u64),
    Text(String),
    Boolean(bool),
}

impl KeyCell {
    fn of(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Null => None,
            CellValue::Integer(v) => Some(KeyCell::Integer(*v)),
            CellValue::Float(v) if *v == 0.0 => Some(KeyCell::Float(0.0f64.to_bits())),
            CellValue::Float(v) => Some(KeyCell::Float(v.to_bits())),
            CellValue::Text(v) => Some(KeyCell::Text(v.clone())),
            CellValue::Boolean(v) => Some(KeyCell::Boolean(*v)),
        }
    }

    fn render(&self) -> String {
        match self {
            KeyCell::Integer(v) => v.to_string(),
            KeyCell::Float(bits) => f64::from_bits(*bits).to_string(),
            KeyCell::Text(v) => v.clone(),
            KeyCell::Boolean(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    keys: Vec<String>,
    rows: BTreeMap<Vec<KeyCell>, Row>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    committed: HashMap<String, MemTable>,
    staged: Option<HashMap<String, MemTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.committed
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed row whose key cells render as `key`, if any. When keys of
    /// different types render alike the first in key order wins.
    pub fn get(&self, table: &str, key: &[&str]) -> Option<Row> {
        self.committed
            .get(table)?
            .rows
            .iter()
            .find(|(k, _)| {
                k.len() == key.len() && k.iter().zip(key).all(|(c, s)| c.render() == *s)
            })
            .map(|(_, row)| row.clone())
    }

    pub fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }
}

fn merge_row(existing: &mut Row, incoming: Row, conflict: &ConflictStrategy) {
    match conflict {
        ConflictStrategy::Replace => *existing = incoming,
        ConflictStrategy::Merge(policy) => {
            for (column, value) in incoming {
                match policy.rule(&column) {
                    Some(MergeRule::KeepExisting) if existing.contains_key(&column) => {}
                    Some(MergeRule::TakeIncomingIfNotNull) if value.is_null() => {}
                    _ => {
                        existing.insert(column, value);
                    }
                }
            }
        }
    }
}

impl DestinationStore for MemoryStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.staged.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.staged = Some(self.committed.clone());
        Ok(())
    }

    fn upsert(
        &mut self,
        table: &str,
        primary_keys: &[String],
        chunk: &RowChunk,
        conflict: &ConflictStrategy,
    ) -> Result<usize, StoreError> {
        let staged = self.staged.as_mut().ok_or(StoreError::NoTransaction)?;

        let key_idx = key_indexes(chunk, primary_keys)?;

        let target = staged.entry(table.to_string()).or_insert_with(|| MemTable {
            keys: primary_keys.to_vec(),
            rows: BTreeMap::new(),
        });
        if target.keys != primary_keys {
            return Err(StoreError::KeyMismatch {
                table: table.to_string(),
                existing: target.keys.clone(),
                requested: primary_keys.to_vec(),
            });
        }

        for values in &chunk.rows {
            let key: Vec<KeyCell> = key_idx
                .iter()
                .filter_map(|&i| KeyCell::of(&values[i]))
                .collect();
            let row: Row = chunk
                .columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect();
            match target.rows.get_mut(&key) {
                Some(existing) => merge_row(existing, row, conflict),
                None => {
                    target.rows.insert(key, row);
                }
            }
        }
        debug!(table, rows = chunk.len(), "staged rows");
        Ok(chunk.len())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or(StoreError::NoTransaction)?;
        self.committed = staged;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged = None;
        Ok(())
    }

    fn count_rows(&self, table: &str) -> Result<usize, StoreError> {
        Ok(self.committed.get(table).map_or(0, |t| t.rows.len()))
    }
}
