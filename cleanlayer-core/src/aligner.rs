//! Time and entity alignment.
//!
//! Three independent operations, each returning a new frame with the same row
//! order as its input (only primary-key enforcement removes rows):
//! - [`Aligner::align_date`]: heterogeneous dates → one normalized column
//! - [`Aligner::align_identifier`]: vendor identifiers → `<code>.<EXCHANGE>`
//! - [`Aligner::build_primary_key`]: verify key columns, last-write-wins dedupe

use crate::dates::{parse_date_series, to_epoch_millis, to_yyyymmdd};
use crate::frame::{self, KeepStrategy};
use crate::identifier::{self, IdentifierResolver};
use crate::schema::MAPPING_FAILED;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AlignmentError {
    #[error("source column '{0}' not found")]
    MissingSourceColumn(String),

    #[error("primary-key column '{0}' not found")]
    MissingKeyColumn(String),

    #[error("identifier '{value}' at row {row} could not be mapped to a canonical code")]
    UnmappedIdentifier { row: usize, value: String },

    #[error(transparent)]
    Frame(#[from] PolarsError),
}

/// Representation of the normalized date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOutput {
    /// `Int64` holding `YYYYMMDD`.
    #[default]
    IntegerYyyymmdd,
    /// `Datetime(ms)` at midnight UTC.
    Timestamp,
}

fn default_date_target() -> String {
    "trade_date".to_string()
}

fn default_identifier_target() -> String {
    "entity_code".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateAlignment {
    pub source: String,
    #[serde(default = "default_date_target")]
    pub target: String,
    #[serde(default)]
    pub output: DateOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierAlignment {
    pub source: String,
    #[serde(default = "default_identifier_target")]
    pub target: String,
    #[serde(default)]
    pub strict: bool,
}

/// Column names for [`Aligner::align_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignSpec {
    #[serde(default)]
    pub date: Option<DateAlignment>,
    #[serde(default)]
    pub identifier: Option<IdentifierAlignment>,
    /// Key columns after alignment. Empty skips the primary-key step.
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default = "default_true")]
    pub enforce_uniqueness: bool,
}

impl Default for AlignSpec {
    fn default() -> Self {
        Self {
            date: None,
            identifier: None,
            primary_key: Vec::new(),
            enforce_uniqueness: true,
        }
    }
}

/// Normalizes dates, identifiers and primary keys.
#[derive(Clone, Default)]
pub struct Aligner {
    resolver: Option<Arc<dyn IdentifierResolver>>,
}

impl fmt::Debug for Aligner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aligner")
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl Aligner {
    pub fn new() -> Self {
        Self { resolver: None }
    }

    /// Use `resolver` as the last resort for identifiers the rule tables miss.
    pub fn with_resolver(resolver: Arc<dyn IdentifierResolver>) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }

    /// Parse `source` into `target`. Unparseable values become null.
    pub fn align_date(
        &self,
        batch: &DataFrame,
        source: &str,
        target: &str,
        output: DateOutput,
    ) -> Result<DataFrame, AlignmentError> {
        let column = batch
            .column(source)
            .map_err(|_| AlignmentError::MissingSourceColumn(source.to_string()))?;
        let parsed = parse_date_series(column.as_materialized_series())?;

        let unparsed = parsed
            .iter()
            .filter(|d| d.is_none())
            .count()
            .saturating_sub(column.null_count());
        if unparsed > 0 {
            warn!(column = source, rows = unparsed, "unparseable dates set to null");
        }

        let aligned = match output {
            DateOutput::IntegerYyyymmdd => {
                let values: Vec<Option<i64>> =
                    parsed.into_iter().map(|d| d.map(to_yyyymmdd)).collect();
                Series::new(target.into(), values)
            }
            DateOutput::Timestamp => {
                let values: Vec<Option<i64>> =
                    parsed.into_iter().map(|d| d.map(to_epoch_millis)).collect();
                Series::new(target.into(), values)
                    .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
            }
        };

        let mut out = batch.clone();
        out.with_column(aligned)?;
        Ok(out)
    }

    /// Map `source` identifiers to canonical codes in `target` and add a
    /// `mapping_failed` flag column.
    ///
    /// Unresolved values keep their raw text in `target` unless `strict`, in
    /// which case the first one aborts the batch. Null identifiers stay null.
    pub fn align_identifier(
        &self,
        batch: &DataFrame,
        source: &str,
        target: &str,
        strict: bool,
    ) -> Result<DataFrame, AlignmentError> {
        let column = batch
            .column(source)
            .map_err(|_| AlignmentError::MissingSourceColumn(source.to_string()))?;
        let raw = identifier_text(column.as_materialized_series())?;

        let mut codes: Vec<Option<String>> = Vec::with_capacity(raw.len());
        let mut failed: Vec<bool> = Vec::with_capacity(raw.len());
        for (row, value) in raw.into_iter().enumerate() {
            let Some(value) = value else {
                codes.push(None);
                failed.push(false);
                continue;
            };
            match self.resolve(&value) {
                Some(code) => {
                    codes.push(Some(code));
                    failed.push(false);
                }
                None if strict => {
                    return Err(AlignmentError::UnmappedIdentifier { row, value });
                }
                None => {
                    codes.push(Some(value));
                    failed.push(true);
                }
            }
        }

        let failures = failed.iter().filter(|f| **f).count();
        if failures > 0 {
            warn!(column = source, rows = failures, "identifiers left unmapped");
        }

        let mut out = batch.clone();
        out.with_column(Series::new(target.into(), codes))?;
        out.with_column(Series::new(MAPPING_FAILED.into(), failed))?;
        Ok(out)
    }

    fn resolve(&self, raw: &str) -> Option<String> {
        if let Some(code) = identifier::canonicalize(raw) {
            return Some(code);
        }
        let resolver = self.resolver.as_ref()?;
        let code = resolver.resolve(raw)?;
        debug!(identifier = raw, code = %code, "resolved through security master");
        Some(code)
    }

    /// Verify `keys` exist and, if `enforce_uniqueness`, keep only the last
    /// row per key tuple.
    pub fn build_primary_key(
        &self,
        batch: &DataFrame,
        keys: &[String],
        enforce_uniqueness: bool,
    ) -> Result<DataFrame, AlignmentError> {
        if let Some(missing) = keys.iter().find(|k| !frame::has_column(batch, k)) {
            return Err(AlignmentError::MissingKeyColumn(missing.clone()));
        }
        if !enforce_uniqueness {
            return Ok(batch.clone());
        }

        let tuples = frame::key_tuples(batch, keys)?;
        let mask = frame::keep_mask(&tuples, KeepStrategy::Last);
        let removed = mask.iter().filter(|keep| !**keep).count();
        if removed == 0 {
            return Ok(batch.clone());
        }
        info!(removed, keys = ?keys, "removed duplicate primary keys (last write wins)");
        Ok(frame::filter_rows(batch, &mask)?)
    }

    /// Date, then identifier, then primary key.
    pub fn align_all(&self, batch: &DataFrame, spec: &AlignSpec) -> Result<DataFrame, AlignmentError> {
        let mut out = batch.clone();
        if let Some(date) = &spec.date {
            out = self.align_date(&out, &date.source, &date.target, date.output)?;
        }
        if let Some(id) = &spec.identifier {
            out = self.align_identifier(&out, &id.source, &id.target, id.strict)?;
        }
        if !spec.primary_key.is_empty() {
            out = self.build_primary_key(&out, &spec.primary_key, spec.enforce_uniqueness)?;
        }
        Ok(out)
    }
}

/// Identifier values as text. Integer codes lose their leading zeros upstream,
/// so they are padded back to six digits.
fn identifier_text(series: &Series) -> PolarsResult<Vec<Option<String>>> {
    let values = match series.dtype() {
        DataType::String => series
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_owned))
            .collect(),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => series
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| {
                v.map(|n| {
                    if (0..1_000_000).contains(&n) {
                        format!("{n:0width$}", width = identifier::CODE_LEN)
                    } else {
                        n.to_string()
                    }
                })
            })
            .collect(),
        _ => series
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_owned))
            .collect(),
    };
    Ok(values)
}
