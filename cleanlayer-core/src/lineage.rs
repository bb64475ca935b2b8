//! Provenance stamping.
//!
//! Every cleaned record carries where it came from (`source_table`), when it
//! went through the clean layer (`processed_at`), which batch version it
//! belongs to (`data_version`) and which job produced it (`ingest_job_id`).

use crate::frame;
use crate::schema::{DATA_VERSION, INGEST_JOB_ID, LINEAGE_COLUMNS, PROCESSED_AT, SOURCE_TABLE};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    #[error("at least one source table is required")]
    NoSourceTables,

    #[error(transparent)]
    Frame(#[from] PolarsError),
}

/// Metadata handed in alongside each batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub source_tables: Vec<String>,
    /// Generated (UUID v4) when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Generated from the processing instant when absent.
    #[serde(default)]
    pub data_version: Option<String>,
}

impl BatchMetadata {
    pub fn new<I, S>(source_tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_tables: source_tables.into_iter().map(Into::into).collect(),
            job_id: None,
            data_version: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_data_version(mut self, version: impl Into<String>) -> Self {
        self.data_version = Some(version.into());
        self
    }
}

pub struct LineageTracker;

impl LineageTracker {
    /// Stamp the four lineage columns using the current UTC instant.
    pub fn attach(batch: &DataFrame, meta: &BatchMetadata) -> Result<DataFrame, LineageError> {
        Self::attach_at(batch, meta, Utc::now())
    }

    /// Stamp lineage as of `processed_at`. Every row gets the same instant.
    pub fn attach_at(
        batch: &DataFrame,
        meta: &BatchMetadata,
        processed_at: DateTime<Utc>,
    ) -> Result<DataFrame, LineageError> {
        if meta.source_tables.is_empty() {
            return Err(LineageError::NoSourceTables);
        }
        let n = batch.height();
        let source_table = meta.source_tables.join(",");
        let version = meta
            .data_version
            .clone()
            .unwrap_or_else(|| auto_version(processed_at));
        let job_id = meta
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let processed = Series::new(PROCESSED_AT.into(), vec![processed_at.timestamp_micros(); n])
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;

        let mut out = batch.clone();
        out.with_column(Series::new(SOURCE_TABLE.into(), vec![source_table; n]))?;
        out.with_column(processed)?;
        out.with_column(Series::new(DATA_VERSION.into(), vec![version; n]))?;
        out.with_column(Series::new(INGEST_JOB_ID.into(), vec![job_id; n]))?;
        Ok(out)
    }

    /// Lineage columns that are missing or contain nulls.
    pub fn validate_completeness(batch: &DataFrame) -> Vec<String> {
        LINEAGE_COLUMNS
            .iter()
            .filter(|name| match batch.column(name) {
                Ok(col) => col.null_count() > 0,
                Err(_) => true,
            })
            .map(|name| name.to_string())
            .collect()
    }
}

/// Timestamp-based version string, e.g. `v20240105T093000.123456Z`.
pub fn auto_version(at: DateTime<Utc>) -> String {
    format!("v{}", at.format("%Y%m%dT%H%M%S%.6fZ"))
}

/// Content hash of a batch (column names and values), usable as a
/// deterministic `data_version`.
pub fn batch_fingerprint(batch: &DataFrame) -> PolarsResult<String> {
    let mut hasher = blake3::Hasher::new();
    let names = frame::column_names(batch);
    for name in &names {
        hasher.update(name.as_bytes());
        hasher.update(&[0x1f]);
    }
    for row in frame::key_tuples(batch, &names)? {
        for cell in row {
            match cell {
                Some(v) => {
                    hasher.update(&[1]);
                    hasher.update(v.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
            hasher.update(&[0x1f]);
        }
        hasher.update(&[0x1e]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn batch() -> DataFrame {
        df!(
            "entity_code" => &["000001.SZ", "600000.SH"],
            "close" => &[10.5, 7.2],
        )
        .unwrap()
    }

    #[test]
    fn attach_stamps_every_row() {
        let meta = BatchMetadata::new(["daily", "adj_factor"])
            .with_job_id("job-42")
            .with_data_version("2024-01-05");
        let out = LineageTracker::attach(&batch(), &meta).unwrap();

        assert!(LineageTracker::validate_completeness(&out).is_empty());
        let src = out.column(SOURCE_TABLE).unwrap().str().unwrap();
        assert_eq!(src.get(1), Some("daily,adj_factor"));
        let job = out.column(INGEST_JOB_ID).unwrap().str().unwrap();
        assert_eq!(job.get(0), Some("job-42"));
        let version = out.column(DATA_VERSION).unwrap().str().unwrap();
        assert_eq!(version.get(0), Some("2024-01-05"));
    }

    #[test]
    fn attach_generates_missing_ids() {
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 9, 30, 0).unwrap();
        let out = LineageTracker::attach_at(&batch(), &BatchMetadata::new(["daily"]), at).unwrap();

        let version = out.column(DATA_VERSION).unwrap().str().unwrap();
        assert_eq!(version.get(0), Some("v20240105T093000.000000Z"));
        let job = out.column(INGEST_JOB_ID).unwrap().str().unwrap();
        let id = job.get(0).unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(job.get(1), Some(id));
    }

    #[test]
    fn processed_at_is_identical_across_rows() {
        let out = LineageTracker::attach(&batch(), &BatchMetadata::new(["daily"])).unwrap();
        let ts = out
            .column(PROCESSED_AT)
            .unwrap()
            .as_materialized_series()
            .cast(&DataType::Int64)
            .unwrap();
        let ts = ts.i64().unwrap();
        assert_eq!(ts.get(0), ts.get(1));
        assert!(ts.get(0).is_some());
    }

    #[test]
    fn input_batch_is_not_mutated() {
        let input = batch();
        let _ = LineageTracker::attach(&input, &BatchMetadata::new(["daily"])).unwrap();
        assert_eq!(input.width(), 2);
        assert_eq!(LineageTracker::validate_completeness(&input).len(), 4);
    }

    #[test]
    fn empty_source_tables_rejected() {
        let meta = BatchMetadata::new(Vec::<String>::new());
        assert!(matches!(
            LineageTracker::attach(&batch(), &meta),
            Err(LineageError::NoSourceTables)
        ));
    }

    #[test]
    fn fingerprint_is_content_addressed() {
        let a = batch_fingerprint(&batch()).unwrap();
        let b = batch_fingerprint(&batch()).unwrap();
        assert_eq!(a, b);

        let other = df!(
            "entity_code" => &["000001.SZ", "600000.SH"],
            "close" => &[10.5, 7.3],
        )
        .unwrap();
        assert_ne!(a, batch_fingerprint(&other).unwrap());
    }
}
