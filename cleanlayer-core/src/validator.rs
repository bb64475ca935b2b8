//! Schema enforcement for incoming batches.
//!
//! The validator detects violations but never repairs them. Fatal findings
//! (missing columns, type mismatches, nulls where forbidden, dropped columns)
//! flip `is_valid`; out-of-range values and duplicate keys only warn. Callers
//! that need a hard stop use [`Validator::validate`], which turns an invalid
//! result into a [`ValidationError`].

use crate::dates::parse_date_series;
use crate::frame::{self, KeepStrategy};
use crate::schema::{ColumnType, TableSchema, ValidationResult, VALIDATION_FLAG};
use polars::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Raised when a batch must not proceed. Carries the full result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("batch failed validation: {}", .result.summary())]
pub struct ValidationError {
    pub result: ValidationResult,
}

/// Checks batches against one table contract.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: TableSchema,
}

impl Validator {
    pub fn new(schema: TableSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Run the missing, type, null, range and duplicate checks.
    pub fn check(&self, batch: &DataFrame) -> ValidationResult {
        let mut result = ValidationResult::valid();

        // 1. Missing columns
        result.missing_columns = self
            .schema
            .required_columns
            .iter()
            .filter(|c| !frame::has_column(batch, c))
            .cloned()
            .collect();

        // 2. Types
        for (column, expected) in &self.schema.column_types {
            let Ok(col) = batch.column(column) else {
                continue;
            };
            if let Some(msg) = type_mismatch(col.as_materialized_series(), *expected) {
                result.type_errors.insert(column.clone(), msg);
            }
        }

        // 3. Nulls in non-nullable required columns
        for column in self.schema.non_nullable_required() {
            let Ok(col) = batch.column(&column) else {
                continue;
            };
            match frame::missing_value_count(col.as_materialized_series()) {
                Ok(0) => {}
                Ok(n) => {
                    debug!(column = %column, nulls = n, "null values in non-nullable column");
                    result.null_fields.insert(column);
                }
                Err(e) => {
                    result
                        .type_errors
                        .insert(column, format!("unreadable column: {e}"));
                }
            }
        }

        // 4. Ranges (warning)
        result.out_of_range_row_ids = self.out_of_range_rows(batch);

        // 5. Duplicate keys (warning)
        if !self.schema.primary_key.is_empty() {
            match find_duplicates(batch, &self.schema.primary_key) {
                Ok(dups) => result.duplicate_count = dups.len(),
                Err(e) => debug!(error = %e, "duplicate check skipped"),
            }
        }

        result.is_valid = result.missing_columns.is_empty()
            && result.type_errors.is_empty()
            && result.null_fields.is_empty();
        result
    }

    /// Fatal if any column present in `input_columns` is absent from `batch`.
    pub fn check_dropped(&self, input_columns: &[String], batch: &DataFrame) -> ValidationResult {
        check_dropped_columns(input_columns, batch)
    }

    /// Hard-stop variant: full check plus dropped-column check against the
    /// columns the batch had before the pipeline started.
    pub fn validate(
        &self,
        batch: &DataFrame,
        input_columns: &[String],
    ) -> Result<ValidationResult, ValidationError> {
        let result = self
            .check(batch)
            .merged(self.check_dropped(input_columns, batch));
        if !result.is_valid {
            return Err(ValidationError { result });
        }
        for line in result.warnings() {
            warn!("{line}");
        }
        Ok(result)
    }

    fn out_of_range_rows(&self, batch: &DataFrame) -> BTreeSet<usize> {
        let mut rows = BTreeSet::new();
        for (column, &(min, max)) in &self.schema.value_ranges {
            let Ok(col) = batch.column(column) else {
                continue;
            };
            if !frame::is_numeric(col.dtype()) {
                continue;
            }
            let Ok(values) = col.as_materialized_series().cast(&DataType::Float64) else {
                continue;
            };
            let Ok(values) = values.f64() else {
                continue;
            };
            for (i, v) in values.into_iter().enumerate() {
                if let Some(v) = v {
                    if !v.is_nan() && (v < min || v > max) {
                        rows.insert(i);
                    }
                }
            }
        }
        rows
    }
}

/// Compare one column's storage type against the expected logical type.
fn type_mismatch(series: &Series, expected: ColumnType) -> Option<String> {
    if series.dtype() == &DataType::Null {
        return None;
    }
    let actual = frame::logical_type(series.dtype());
    let compatible = match (expected, actual) {
        (e, Some(a)) if e == a => true,
        (ColumnType::Float, Some(ColumnType::Integer)) => true,
        (ColumnType::Integer, Some(ColumnType::Float)) => all_integral(series),
        (
            ColumnType::Timestamp,
            Some(ColumnType::Text | ColumnType::Integer | ColumnType::Float),
        ) => {
            all_parse_as_dates(series)
        }
        _ => false,
    };
    if compatible {
        return None;
    }
    let got = actual
        .map(|a| a.to_string())
        .unwrap_or_else(|| series.dtype().to_string());
    Some(format!("expected {expected}, got {got}"))
}

fn all_integral(series: &Series) -> bool {
    let Ok(floats) = series.cast(&DataType::Float64) else {
        return false;
    };
    let Ok(values) = floats.f64() else {
        return false;
    };
    let integral = values
        .into_iter()
        .flatten()
        .all(|v| v.is_nan() || v.fract() == 0.0);
    integral
}

fn all_parse_as_dates(series: &Series) -> bool {
    match parse_date_series(series) {
        Ok(parsed) => parsed.iter().flatten().count() == series.len() - series.null_count(),
        Err(_) => false,
    }
}

/// Fatal if any of `input_columns` is absent from `batch`.
pub fn check_dropped_columns(input_columns: &[String], batch: &DataFrame) -> ValidationResult {
    let mut result = ValidationResult::valid();
    result.dropped_columns = input_columns
        .iter()
        .filter(|c| !frame::has_column(batch, c))
        .cloned()
        .collect();
    result.is_valid = result.dropped_columns.is_empty();
    result
}

/// Positions of rows repeating an earlier key tuple.
pub fn find_duplicates(batch: &DataFrame, keys: &[String]) -> PolarsResult<Vec<usize>> {
    let tuples = frame::key_tuples(batch, keys)?;
    Ok(frame::later_duplicate_positions(&tuples))
}

/// Drop all but one occurrence per key tuple. Not applied by `check`.
pub fn deduplicate(
    batch: &DataFrame,
    keys: &[String],
    keep: KeepStrategy,
) -> PolarsResult<DataFrame> {
    let tuples = frame::key_tuples(batch, keys)?;
    let mask = frame::keep_mask(&tuples, keep);
    frame::filter_rows(batch, &mask)
}

/// Set `validation_flag` to 1 on the given rows, leaving other rows' flags as
/// they were (0 when the column is new).
pub fn flag(batch: &DataFrame, row_ids: &BTreeSet<usize>) -> PolarsResult<DataFrame> {
    let mut flags: Vec<i32> = match batch.column(VALIDATION_FLAG) {
        Ok(existing) => existing
            .as_materialized_series()
            .cast(&DataType::Int32)?
            .i32()?
            .into_iter()
            .map(|v| v.unwrap_or(0))
            .collect(),
        Err(_) => vec![0; batch.height()],
    };
    for &i in row_ids {
        if let Some(slot) = flags.get_mut(i) {
            *slot = 1;
        }
    }
    let mut out = batch.clone();
    out.with_column(Series::new(VALIDATION_FLAG.into(), flags))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily_schema() -> TableSchema {
        TableSchema::new()
            .require("entity_code", ColumnType::Text)
            .require("trade_date", ColumnType::Timestamp)
            .require("close", ColumnType::Float)
            .require_nullable("pe_ratio", ColumnType::Float)
            .with_range("pe_ratio", 0.0, 200.0)
            .with_primary_key(["entity_code", "trade_date"])
    }

    fn daily_batch() -> DataFrame {
        df!(
            "entity_code" => &["000001.SZ", "600000.SH", "000001.SZ"],
            "trade_date" => &["2024-01-05", "2024-01-05", "2024-01-08"],
            "close" => &[10.5, 7.2, 10.7],
            "pe_ratio" => &[Some(8.1), None, Some(8.3)],
        )
        .unwrap()
    }

    #[test]
    fn clean_batch_passes() {
        let result = Validator::new(daily_schema()).check(&daily_batch());
        assert!(result.is_valid, "{}", result.summary());
        assert!(!result.has_warnings());
    }

    #[test]
    fn missing_columns_are_exact_set_difference() {
        let batch = daily_batch().drop("close").unwrap().drop("pe_ratio").unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(!result.is_valid);
        let expected: BTreeSet<String> =
            ["close", "pe_ratio"].iter().map(|s| s.to_string()).collect();
        assert_eq!(result.missing_columns, expected);
    }

    #[test]
    fn integer_column_satisfies_float() {
        let batch = df!(
            "entity_code" => &["000001.SZ"],
            "trade_date" => &[20240105i64],
            "close" => &[10i32],
            "pe_ratio" => &[8i64],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(result.type_errors.is_empty(), "{:?}", result.type_errors);
    }

    #[test]
    fn text_in_float_column_is_type_error() {
        let batch = df!(
            "entity_code" => &["000001.SZ"],
            "trade_date" => &["2024-01-05"],
            "close" => &["ten"],
            "pe_ratio" => &[8.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(!result.is_valid);
        assert_eq!(result.type_errors["close"], "expected float, got text");
    }

    #[test]
    fn unparseable_timestamp_text_is_type_error() {
        let batch = df!(
            "entity_code" => &["000001.SZ", "000002.SZ"],
            "trade_date" => &["2024-01-05", "yesterday"],
            "close" => &[1.0, 2.0],
            "pe_ratio" => &[8.0, 9.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert_eq!(result.type_errors["trade_date"], "expected timestamp, got text");
    }

    #[test]
    fn yyyymmdd_floats_satisfy_timestamp() {
        let batch = df!(
            "entity_code" => &["000001.SZ", "600000.SH"],
            "trade_date" => &[Some(20240105.0), None],
            "close" => &[10.5, 7.2],
            "pe_ratio" => &[8.0, 9.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(result.type_errors.is_empty(), "{:?}", result.type_errors);

        let bad = df!(
            "entity_code" => &["000001.SZ"],
            "trade_date" => &[20241399.0],
            "close" => &[10.5],
            "pe_ratio" => &[8.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&bad);
        assert_eq!(result.type_errors["trade_date"], "expected timestamp, got float");
    }

    #[test]
    fn integral_floats_with_nulls_satisfy_integer() {
        let schema = TableSchema::new().require_nullable("volume", ColumnType::Integer);
        let batch = df!("volume" => &[Some(100.0), None, Some(f64::NAN)]).unwrap();
        let result = Validator::new(schema).check(&batch);
        assert!(result.type_errors.is_empty(), "{:?}", result.type_errors);
    }

    #[test]
    fn fractional_float_does_not_satisfy_integer() {
        let schema = TableSchema::new().require("volume", ColumnType::Integer);
        let ok = df!("volume" => &[100.0, 200.0]).unwrap();
        let bad = df!("volume" => &[100.5, 200.0]).unwrap();
        assert!(Validator::new(schema.clone()).check(&ok).is_valid);
        assert!(!Validator::new(schema).check(&bad).is_valid);
    }

    #[test]
    fn null_in_non_nullable_column_is_fatal() {
        let batch = df!(
            "entity_code" => &["000001.SZ", "600000.SH"],
            "trade_date" => &["2024-01-05", "2024-01-05"],
            "close" => &[Some(10.5), None],
            "pe_ratio" => &[None::<f64>, None],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(!result.is_valid);
        assert!(result.null_fields.contains("close"));
        assert!(!result.null_fields.contains("pe_ratio"));
    }

    #[test]
    fn out_of_range_is_warning_only() {
        let batch = df!(
            "entity_code" => &["000001.SZ", "600000.SH"],
            "trade_date" => &["2024-01-05", "2024-01-05"],
            "close" => &[10.5, 7.2],
            "pe_ratio" => &[500.0, 12.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(result.is_valid);
        assert_eq!(result.out_of_range_row_ids.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn duplicates_are_counted_not_removed() {
        let batch = df!(
            "entity_code" => &["000001.SZ", "000001.SZ"],
            "trade_date" => &["2024-01-05", "2024-01-05"],
            "close" => &[10.5, 10.6],
            "pe_ratio" => &[8.0, 8.0],
        )
        .unwrap();
        let result = Validator::new(daily_schema()).check(&batch);
        assert!(result.is_valid);
        assert_eq!(result.duplicate_count, 1);
    }

    #[test]
    fn deduplicate_keeps_last_occurrence() {
        let batch = df!(
            "k" => &["a", "b", "a"],
            "v" => &[1i64, 2, 3],
        )
        .unwrap();
        let out = deduplicate(&batch, &["k".to_string()], KeepStrategy::Last).unwrap();
        assert_eq!(out.height(), 2);
        let v = out.column("v").unwrap().i64().unwrap();
        assert_eq!(v.get(0), Some(2));
        assert_eq!(v.get(1), Some(3));
    }

    #[test]
    fn dropped_column_is_fatal() {
        let batch = daily_batch();
        let mut input = frame::column_names(&batch);
        input.push("turnover".into());
        let result = check_dropped_columns(&input, &batch);
        assert!(!result.is_valid);
        assert!(result.dropped_columns.contains("turnover"));
    }

    #[test]
    fn validate_returns_error_carrying_result() {
        let batch = daily_batch().drop("close").unwrap();
        let input = frame::column_names(&batch);
        let err = Validator::new(daily_schema())
            .validate(&batch, &input)
            .unwrap_err();
        assert!(err.result.missing_columns.contains("close"));
        assert!(err.to_string().contains("close"));
    }

    #[test]
    fn flag_marks_rows_and_preserves_existing_flags() {
        let batch = df!("x" => &[1i64, 2, 3]).unwrap();
        let once = flag(&batch, &BTreeSet::from([0])).unwrap();
        let twice = flag(&once, &BTreeSet::from([2])).unwrap();
        let flags = twice.column(VALIDATION_FLAG).unwrap().i32().unwrap();
        assert_eq!(flags.get(0), Some(1));
        assert_eq!(flags.get(1), Some(0));
        assert_eq!(flags.get(2), Some(1));
    }
}
