//! Column contract for one logical table and the structured outcome of checking it.
//!
//! A [`TableSchema`] states which columns must exist, what logical type each
//! carries, which may hold nulls and which numeric bounds are plausible. The
//! validator reports against it through a [`ValidationResult`], which separates
//! fatal findings (they flip `is_valid`) from warnings (they never do).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lineage column: comma-joined list of upstream tables.
pub const SOURCE_TABLE: &str = "source_table";
/// Lineage column: UTC instant the batch went through the lineage stage.
pub const PROCESSED_AT: &str = "processed_at";
/// Lineage column: caller-supplied or generated batch version.
pub const DATA_VERSION: &str = "data_version";
/// Lineage column: run identifier of the ingest job.
pub const INGEST_JOB_ID: &str = "ingest_job_id";
/// Non-zero marks a warning-level anomaly on the row.
pub const VALIDATION_FLAG: &str = "validation_flag";
/// True where an identifier could not be mapped to canonical form.
pub const MAPPING_FAILED: &str = "mapping_failed";

/// The four provenance columns stamped on every cleaned record.
pub const LINEAGE_COLUMNS: [&str; 4] = [SOURCE_TABLE, PROCESSED_AT, DATA_VERSION, INGEST_JOB_ID];

/// Columns the clean layer may add on its own. Anything else a stage adds has
/// to be asked for by the caller (alignment targets, preserved originals).
pub const RESERVED_COLUMNS: [&str; 6] = [
    SOURCE_TABLE,
    PROCESSED_AT,
    DATA_VERSION,
    INGEST_JOB_ID,
    VALIDATION_FLAG,
    MAPPING_FAILED,
];

/// Whether `name` is one of the reserved lineage/flag columns.
pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

/// Logical column type expected by a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("nullable column '{0}' is not a required column")]
    NullableNotRequired(String),

    #[error("invalid range for column '{column}': min {min} > max {max}")]
    InvalidRange { column: String, min: f64, max: f64 },

    #[error("primary-key column '{0}' is not a required column")]
    KeyNotRequired(String),
}

/// Declarative contract for one logical table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns that must be present.
    #[serde(default)]
    pub required_columns: BTreeSet<String>,

    /// Expected logical type per column (checked when the column is present).
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,

    /// Required columns allowed to contain nulls.
    #[serde(default)]
    pub nullable_columns: BTreeSet<String>,

    /// Numeric sanity bounds, inclusive.
    #[serde(default)]
    pub value_ranges: BTreeMap<String, (f64, f64)>,

    /// Key columns for the duplicate check. Empty disables it.
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required, non-nullable column of the given type.
    pub fn require(mut self, column: &str, dtype: ColumnType) -> Self {
        self.required_columns.insert(column.to_string());
        self.column_types.insert(column.to_string(), dtype);
        self
    }

    /// Add a required column that may contain nulls.
    pub fn require_nullable(mut self, column: &str, dtype: ColumnType) -> Self {
        self.required_columns.insert(column.to_string());
        self.nullable_columns.insert(column.to_string());
        self.column_types.insert(column.to_string(), dtype);
        self
    }

    /// Type-check an optional column whenever it shows up.
    pub fn with_type(mut self, column: &str, dtype: ColumnType) -> Self {
        self.column_types.insert(column.to_string(), dtype);
        self
    }

    pub fn with_range(mut self, column: &str, min: f64, max: f64) -> Self {
        self.value_ranges.insert(column.to_string(), (min, max));
        self
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Required columns that must never hold a null.
    pub fn non_nullable_required(&self) -> BTreeSet<String> {
        self.required_columns
            .difference(&self.nullable_columns)
            .cloned()
            .collect()
    }

    /// Check the schema's own invariants. Schemas built with the chained
    /// helpers always pass; deserialized ones may not.
    pub fn check_consistency(&self) -> Result<(), SchemaError> {
        if let Some(col) = self
            .nullable_columns
            .iter()
            .find(|c| !self.required_columns.contains(*c))
        {
            return Err(SchemaError::NullableNotRequired(col.clone()));
        }
        for (column, &(min, max)) in &self.value_ranges {
            if min > max || min.is_nan() || max.is_nan() {
                return Err(SchemaError::InvalidRange {
                    column: column.clone(),
                    min,
                    max,
                });
            }
        }
        if let Some(col) = self
            .primary_key
            .iter()
            .find(|c| !self.required_columns.contains(*c))
        {
            return Err(SchemaError::KeyNotRequired(col.clone()));
        }
        Ok(())
    }
}

/// Outcome of checking a batch against a [`TableSchema`].
///
/// `is_valid` is false only for fatal findings: missing columns, type
/// mismatches, nulls in non-nullable required columns, and dropped columns.
/// Range violations and duplicate keys are warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_columns: BTreeSet<String>,
    /// Column → "expected X, got Y".
    pub type_errors: BTreeMap<String, String>,
    pub null_fields: BTreeSet<String>,
    /// Positional row indices outside a declared range.
    pub out_of_range_row_ids: BTreeSet<usize>,
    pub dropped_columns: BTreeSet<String>,
    /// Rows whose key tuple already appeared earlier in the batch.
    pub duplicate_count: usize,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

impl ValidationResult {
    /// A result with no findings.
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            missing_columns: BTreeSet::new(),
            type_errors: BTreeMap::new(),
            null_fields: BTreeSet::new(),
            out_of_range_row_ids: BTreeSet::new(),
            dropped_columns: BTreeSet::new(),
            duplicate_count: 0,
        }
    }

    /// Union every collection; valid only if both sides are valid.
    pub fn merge(&mut self, other: ValidationResult) {
        self.is_valid = self.is_valid && other.is_valid;
        self.missing_columns.extend(other.missing_columns);
        self.type_errors.extend(other.type_errors);
        self.null_fields.extend(other.null_fields);
        self.out_of_range_row_ids.extend(other.out_of_range_row_ids);
        self.dropped_columns.extend(other.dropped_columns);
        self.duplicate_count += other.duplicate_count;
    }

    /// Consuming variant of [`merge`](Self::merge).
    pub fn merged(mut self, other: ValidationResult) -> Self {
        self.merge(other);
        self
    }

    pub fn has_warnings(&self) -> bool {
        !self.out_of_range_row_ids.is_empty() || self.duplicate_count > 0
    }

    /// Human-readable warning lines, empty when there are none.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.out_of_range_row_ids.is_empty() {
            out.push(format!(
                "{} row(s) outside declared value ranges",
                self.out_of_range_row_ids.len()
            ));
        }
        if self.duplicate_count > 0 {
            out.push(format!(
                "{} row(s) repeat an earlier primary-key tuple",
                self.duplicate_count
            ));
        }
        out
    }

    /// Human-readable list of the fatal findings.
    pub fn errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        for col in &self.missing_columns {
            out.push(format!("missing required column '{col}'"));
        }
        for (col, msg) in &self.type_errors {
            out.push(format!("column '{col}': {msg}"));
        }
        for col in &self.null_fields {
            out.push(format!("null values in non-nullable column '{col}'"));
        }
        for col in &self.dropped_columns {
            out.push(format!("column '{col}' was dropped"));
        }
        out
    }

    /// One-line summary for logs and error messages.
    pub fn summary(&self) -> String {
        let errors = self.errors();
        if errors.is_empty() {
            "no fatal findings".to_string()
        } else {
            errors.join("; ")
        }
    }
}
