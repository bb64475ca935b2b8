//! Idempotent, chunked, retried persistence of cleaned batches.
//!
//! A batch is split into chunks of at most `batch_size` rows. Each chunk runs
//! in its own transaction: begin, keyed upsert, commit. A failure rolls the
//! chunk back and retries it after an exponential backoff; once retries are
//! exhausted the write stops with the earlier chunks committed and nothing of
//! the failed chunk visible. Because every row lands through a primary-key
//! upsert, rerunning the same batch leaves one row per key.

use crate::conflict::ConflictStrategy;
use crate::retry::Backoff;
use crate::rows::RowChunk;
use crate::store::{DestinationStore, StoreError};
use cleanlayer_core::frame;
use cleanlayer_core::schema::is_reserved_column;
use polars::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("target table name is empty")]
    EmptyTarget,

    #[error("at least one primary-key column is required")]
    NoPrimaryKey,

    #[error("primary-key column '{0}' is not in the batch")]
    MissingKeyColumn(String),

    #[error("primary-key column '{column}' is null at row {row}")]
    NullKey { column: String, row: usize },

    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,

    #[error("unsupported conflict strategy '{0}'")]
    UnsupportedStrategy(String),

    #[error("merge policy has no rule for column '{0}'")]
    IncompleteMergePolicy(String),

    #[error("chunk {chunk_index} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        chunk_index: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("write cancelled after {committed_chunks} chunk(s), {rows_written} row(s)")]
    Cancelled {
        committed_chunks: usize,
        rows_written: usize,
    },

    #[error("frame error: {0}")]
    Frame(#[from] PolarsError),
}

/// Columns an output table gained or lost relative to its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column drift: missing {missing:?}, unexpected {unexpected:?}")]
pub struct ColumnDrift {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Every input column must survive; the only additions allowed are lineage and
/// flag columns.
pub fn verify_columns_preserved(
    input_columns: &[String],
    target_columns: &[String],
) -> Result<(), ColumnDrift> {
    let missing: Vec<String> = input_columns
        .iter()
        .filter(|c| !target_columns.contains(c))
        .cloned()
        .collect();
    let unexpected: Vec<String> = target_columns
        .iter()
        .filter(|c| !input_columns.contains(c) && !is_reserved_column(c))
        .cloned()
        .collect();
    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(ColumnDrift {
            missing,
            unexpected,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    pub conflict: ConflictStrategy,
    pub batch_size: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            conflict: ConflictStrategy::Replace,
            batch_size: 10_000,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl WriteOptions {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_retries)
    }
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Transaction states a chunk passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Committed,
    RolledBackRetrying,
    RolledBackFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub index: usize,
    pub rows: usize,
    pub attempts: u32,
    pub history: Vec<ChunkState>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub rows_written: usize,
    pub chunks: Vec<ChunkOutcome>,
}

impl WriteReport {
    pub fn committed_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Total retries across all chunks.
    pub fn retries(&self) -> u32 {
        self.chunks.iter().map(|c| c.attempts.saturating_sub(1)).sum()
    }
}

/// Writes batches into a [`DestinationStore`]. Holds no state between calls
/// beyond the store itself.
pub struct IdempotentWriter<S: DestinationStore> {
    store: S,
    options: WriteOptions,
}

impl<S: DestinationStore> IdempotentWriter<S> {
    pub fn new(store: S, options: WriteOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Upsert `batch` into `target` keyed on `primary_keys`.
    pub fn write<K: AsRef<str>>(
        &mut self,
        batch: &DataFrame,
        target: &str,
        primary_keys: &[K],
        cancel: Option<&CancelToken>,
    ) -> Result<WriteReport, WriteError> {
        let keys: Vec<String> = primary_keys.iter().map(|k| k.as_ref().to_string()).collect();
        self.check_request(batch, target, &keys)?;

        let mut report = WriteReport::default();
        let height = batch.height();
        let batch_size = self.options.batch_size;

        for (index, offset) in (0..height).step_by(batch_size).enumerate() {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                warn!(table = target, committed_chunks = report.committed_chunks(), "write cancelled");
                return Err(WriteError::Cancelled {
                    committed_chunks: report.committed_chunks(),
                    rows_written: report.rows_written,
                });
            }

            let len = batch_size.min(height - offset);
            let slice = batch.slice(i64::try_from(offset).unwrap_or(i64::MAX), len);
            let rows = RowChunk::from_frame(&slice)?;
            let outcome = self.write_chunk(index, target, &keys, &rows)?;
            report.rows_written += outcome.rows;
            report.chunks.push(outcome);
        }

        info!(
            table = target,
            rows = report.rows_written,
            chunks = report.committed_chunks(),
            strategy = self.options.conflict.name(),
            "batch written"
        );
        Ok(report)
    }

    fn check_request(
        &self,
        batch: &DataFrame,
        target: &str,
        keys: &[String],
    ) -> Result<(), WriteError> {
        if target.trim().is_empty() {
            return Err(WriteError::EmptyTarget);
        }
        if keys.is_empty() {
            return Err(WriteError::NoPrimaryKey);
        }
        let columns: Vec<String> = batch
            .get_column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        if let Some(k) = keys.iter().find(|k| !columns.contains(k)) {
            return Err(WriteError::MissingKeyColumn(k.clone()));
        }
        for key in keys {
            if let Some(row) = first_missing(batch.column(key)?.as_materialized_series())? {
                return Err(WriteError::NullKey {
                    column: key.clone(),
                    row,
                });
            }
        }
        if self.options.batch_size == 0 {
            return Err(WriteError::ZeroBatchSize);
        }
        if let ConflictStrategy::Merge(policy) = &self.options.conflict {
            policy.check_covers(&columns, keys)?;
        }
        Ok(())
    }

    fn write_chunk(
        &mut self,
        index: usize,
        target: &str,
        keys: &[String],
        rows: &RowChunk,
    ) -> Result<ChunkOutcome, WriteError> {
        let backoff = self.options.backoff();
        let mut history = Vec::new();
        let mut retries = 0u32;

        loop {
            let attempts = retries + 1;
            match self.try_chunk(target, keys, rows) {
                Ok(written) => {
                    history.push(ChunkState::Committed);
                    debug!(table = target, chunk = index, rows = written, attempts, "chunk committed");
                    return Ok(ChunkOutcome {
                        index,
                        rows: written,
                        attempts,
                        history,
                    });
                }
                Err(err) => {
                    if let Err(rb) = self.store.rollback() {
                        warn!(table = target, chunk = index, error = %rb, "rollback failed");
                    }
                    if !backoff.should_retry(retries) {
                        history.push(ChunkState::RolledBackFailed);
                        warn!(table = target, chunk = index, attempts, error = %err, "chunk failed");
                        return Err(WriteError::ChunkFailed {
                            chunk_index: index,
                            attempts,
                            source: err,
                        });
                    }
                    history.push(ChunkState::RolledBackRetrying);
                    let delay = backoff.delay_for(retries);
                    warn!(
                        table = target,
                        chunk = index,
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "chunk rolled back, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    retries += 1;
                }
            }
        }
    }

    fn try_chunk(
        &mut self,
        target: &str,
        keys: &[String],
        rows: &RowChunk,
    ) -> Result<usize, StoreError> {
        self.store.begin()?;
        let written = self
            .store
            .upsert(target, keys, rows, &self.options.conflict)?;
        self.store.commit()?;
        Ok(written)
    }
}

/// Position of the first null, or NaN for float columns.
fn first_missing(series: &Series) -> PolarsResult<Option<usize>> {
    if frame::missing_value_count(series)? == 0 {
        return Ok(None);
    }
    let null = series.is_null().into_iter().position(|v| v == Some(true));
    let nan = if matches!(series.dtype(), DataType::Float32 | DataType::Float64) {
        series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .position(|v| v.is_some_and(f64::is_nan))
    } else {
        None
    };
    Ok(match (null, nan) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    })
}
