//! Clean Layer runner: composes the core stages for whole batches and
//! persists the result.
//!
//! - Pipeline: validate, align, standardize, attach lineage, for one batch or
//!   many in parallel
//! - Idempotent writer: chunked keyed upserts, one transaction per chunk,
//!   exponential-backoff retries, cooperative cancellation
//! - Destination stores: in-memory and SQLite
//! - TOML pipeline configuration

pub mod config;
pub mod conflict;
pub mod pipeline;
pub mod retry;
pub mod rows;
pub mod store;
pub mod writer;

pub use config::{ConfigError, PipelineConfig, WriteSettings};
pub use conflict::{ConflictStrategy, MergePolicy, MergeRule};
pub use pipeline::{CleanOutcome, CleanPipeline, PipelineError, RunOutcome};
pub use retry::Backoff;
pub use rows::{CellKind, CellValue, RowChunk};
pub use store::{DestinationStore, MemoryStore, SqliteStore, StoreError};
pub use writer::{
    verify_columns_preserved, CancelToken, ChunkOutcome, ChunkState, ColumnDrift,
    IdempotentWriter, WriteError, WriteOptions, WriteReport,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<CleanPipeline>();
        assert_sync::<CleanPipeline>();
    }

    #[test]
    fn writer_parts_are_send_sync() {
        assert_send::<IdempotentWriter<MemoryStore>>();
        assert_send::<CancelToken>();
        assert_sync::<CancelToken>();
        assert_send::<WriteOptions>();
        assert_sync::<WriteReport>();
    }

    #[test]
    fn config_is_send_sync() {
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
    }
}
