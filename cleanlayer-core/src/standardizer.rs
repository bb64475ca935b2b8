//! Unit normalization for monetary and volume columns.
//!
//! Conversion factors live in fixed tables. Converting overwrites the column in
//! place with base-unit values; the pre-conversion values can be kept in a
//! `<column>_<unit>` copy. An unknown unit is a warning, not an error, so that
//! partially described sources still get through.

use crate::frame;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Base currency unit, ten-thousand and hundred-million multiples.
pub const MONETARY_UNITS: &[(&str, f64)] = &[
    ("yuan", 1.0),
    ("unit", 1.0),
    ("ten-thousand-units", 10_000.0),
    ("ten_thousand", 10_000.0),
    ("wan", 10_000.0),
    ("hundred-million-units", 100_000_000.0),
    ("hundred_million", 100_000_000.0),
    ("yi", 100_000_000.0),
];

/// Board lots of 100 shares, and shares.
pub const VOLUME_UNITS: &[(&str, f64)] = &[("share", 1.0), ("lot", 100.0), ("hand", 100.0)];

/// Suffix of the pre-adjustment snapshot column.
pub const UNADJUSTED_SUFFIX: &str = "_unadjusted";

#[derive(Debug, thiserror::Error)]
pub enum StandardizationError {
    #[error("column '{0}' not found")]
    MissingColumn(String),

    #[error("column '{column}' is not numeric ({dtype})")]
    NonNumeric { column: String, dtype: String },

    #[error(transparent)]
    Frame(#[from] PolarsError),
}

/// Look up a conversion factor, ignoring ASCII case.
pub fn factor_for(table: &[(&str, f64)], unit: &str) -> Option<f64> {
    table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(unit.trim()))
        .map(|&(_, f)| f)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConversion {
    pub column: String,
    pub unit: String,
}

/// Column/unit maps for [`Standardizer::standardize_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizeSpec {
    #[serde(default)]
    pub monetary: Vec<UnitConversion>,
    #[serde(default)]
    pub volume: Vec<UnitConversion>,
    #[serde(default)]
    pub unadjusted: Vec<String>,
    #[serde(default = "default_true")]
    pub preserve_original: bool,
}

impl Default for StandardizeSpec {
    fn default() -> Self {
        Self {
            monetary: Vec::new(),
            volume: Vec::new(),
            unadjusted: Vec::new(),
            preserve_original: true,
        }
    }
}

/// Stateless unit normalizer.
pub struct Standardizer;

impl Standardizer {
    /// Convert a monetary column to the base currency unit.
    pub fn convert_monetary(
        batch: &DataFrame,
        column: &str,
        source_unit: &str,
        preserve_original: bool,
    ) -> Result<DataFrame, StandardizationError> {
        convert(batch, column, source_unit, preserve_original, MONETARY_UNITS)
    }

    /// Convert a volume column to shares.
    pub fn convert_volume(
        batch: &DataFrame,
        column: &str,
        source_unit: &str,
        preserve_original: bool,
    ) -> Result<DataFrame, StandardizationError> {
        convert(batch, column, source_unit, preserve_original, VOLUME_UNITS)
    }

    /// Copy each price column to `<column>_unadjusted` so the pre-adjustment
    /// value survives whatever a later adjustment step does. An existing
    /// snapshot is left as is.
    pub fn preserve_unadjusted(
        batch: &DataFrame,
        price_columns: &[String],
    ) -> Result<DataFrame, StandardizationError> {
        let mut out = batch.clone();
        for column in price_columns {
            let source = batch
                .column(column)
                .map_err(|_| StandardizationError::MissingColumn(column.clone()))?;
            let snapshot = format!("{column}{UNADJUSTED_SUFFIX}");
            if frame::has_column(batch, &snapshot) {
                debug!(column = %column, "unadjusted snapshot already present");
                continue;
            }
            let copy = source
                .as_materialized_series()
                .clone()
                .with_name(snapshot.as_str().into());
            out.with_column(copy)?;
        }
        Ok(out)
    }

    /// Monetary, then volume, then unadjusted snapshots.
    pub fn standardize_all(
        batch: &DataFrame,
        spec: &StandardizeSpec,
    ) -> Result<DataFrame, StandardizationError> {
        let mut out = batch.clone();
        for conv in &spec.monetary {
            out = Self::convert_monetary(&out, &conv.column, &conv.unit, spec.preserve_original)?;
        }
        for conv in &spec.volume {
            out = Self::convert_volume(&out, &conv.column, &conv.unit, spec.preserve_original)?;
        }
        if !spec.unadjusted.is_empty() {
            out = Self::preserve_unadjusted(&out, &spec.unadjusted)?;
        }
        Ok(out)
    }
}

fn convert(
    batch: &DataFrame,
    column: &str,
    source_unit: &str,
    preserve_original: bool,
    table: &[(&str, f64)],
) -> Result<DataFrame, StandardizationError> {
    let source = batch
        .column(column)
        .map_err(|_| StandardizationError::MissingColumn(column.to_string()))?;

    let Some(factor) = factor_for(table, source_unit) else {
        warn!(column, unit = source_unit, "unknown unit, values left unconverted");
        return Ok(batch.clone());
    };

    let dtype = source.dtype();
    if !frame::is_numeric(dtype) && dtype != &DataType::Null {
        return Err(StandardizationError::NonNumeric {
            column: column.to_string(),
            dtype: dtype.to_string(),
        });
    }

    let original = source.as_materialized_series().clone();
    let mut out = batch.clone();
    if preserve_original {
        let copy_name = format!("{column}_{source_unit}");
        out.with_column(original.clone().with_name(copy_name.as_str().into()))?;
    }

    if factor == 1.0 {
        info!(column, unit = source_unit, "already in base unit");
        return Ok(out);
    }

    let scaled: Vec<Option<f64>> = original
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .map(|v| v.map(|x| x * factor))
        .collect();
    out.with_column(Series::new(column.into(), scaled))?;
    debug!(column, unit = source_unit, factor, "converted to base unit");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_thousand_units_multiply_and_preserve() {
        let batch = df!("amount" => &[Some(1.5), None, Some(-2.0)]).unwrap();
        let out =
            Standardizer::convert_monetary(&batch, "amount", "ten-thousand-units", true).unwrap();
        let amount = out.column("amount").unwrap().f64().unwrap();
        assert_eq!(amount.get(0), Some(15_000.0));
        assert_eq!(amount.get(1), None);
        assert_eq!(amount.get(2), Some(-20_000.0));

        let original = out
            .column("amount_ten-thousand-units")
            .unwrap()
            .f64()
            .unwrap();
        assert_eq!(original.get(0), Some(1.5));
        assert_eq!(original.get(2), Some(-2.0));
    }

    #[test]
    fn hundred_million_alias() {
        let batch = df!("mkt_cap" => &[3i64]).unwrap();
        let out = Standardizer::convert_monetary(&batch, "mkt_cap", "yi", false).unwrap();
        assert_eq!(out.column("mkt_cap").unwrap().f64().unwrap().get(0), Some(3.0e8));
        assert_eq!(out.width(), 1);
    }

    #[test]
    fn base_unit_is_noop_but_still_preserved() {
        let batch = df!("amount" => &[12i64]).unwrap();
        let out = Standardizer::convert_monetary(&batch, "amount", "yuan", true).unwrap();
        assert_eq!(out.column("amount").unwrap().i64().unwrap().get(0), Some(12));
        assert!(frame::has_column(&out, "amount_yuan"));
    }

    #[test]
    fn unknown_unit_passes_through() {
        let batch = df!("amount" => &[1.0]).unwrap();
        let out = Standardizer::convert_monetary(&batch, "amount", "furlongs", true).unwrap();
        assert_eq!(out.width(), 1);
        assert_eq!(out.column("amount").unwrap().f64().unwrap().get(0), Some(1.0));
    }

    #[test]
    fn missing_column_is_error() {
        let batch = df!("amount" => &[1.0]).unwrap();
        let err = Standardizer::convert_volume(&batch, "volume", "lot", true).unwrap_err();
        assert!(matches!(err, StandardizationError::MissingColumn(c) if c == "volume"));
    }

    #[test]
    fn text_column_is_not_convertible() {
        let batch = df!("volume" => &["12"]).unwrap();
        let err = Standardizer::convert_volume(&batch, "volume", "lot", true).unwrap_err();
        assert!(matches!(err, StandardizationError::NonNumeric { .. }));
    }

    #[test]
    fn lots_become_shares() {
        let batch = df!("volume" => &[12i64, 0]).unwrap();
        let out = Standardizer::convert_volume(&batch, "volume", "lot", true).unwrap();
        let v = out.column("volume").unwrap().f64().unwrap();
        assert_eq!(v.get(0), Some(1200.0));
        assert_eq!(v.get(1), Some(0.0));
        assert_eq!(out.column("volume_lot").unwrap().i64().unwrap().get(0), Some(12));
    }

    #[test]
    fn unadjusted_snapshot_includes_nulls() {
        let batch = df!("close" => &[Some(10.0), None]).unwrap();
        let out = Standardizer::preserve_unadjusted(&batch, &["close".to_string()]).unwrap();
        let snap = out.column("close_unadjusted").unwrap().f64().unwrap();
        assert_eq!(snap.get(0), Some(10.0));
        assert_eq!(snap.get(1), None);
    }

    #[test]
    fn existing_snapshot_is_kept() {
        let batch = df!(
            "close" => &[11.0],
            "close_unadjusted" => &[10.0],
        )
        .unwrap();
        let out = Standardizer::preserve_unadjusted(&batch, &["close".to_string()]).unwrap();
        let snap = out.column("close_unadjusted").unwrap().f64().unwrap();
        assert_eq!(snap.get(0), Some(10.0));
    }

    #[test]
    fn empty_batch_is_fine() {
        let batch = df!("amount" => Vec::<f64>::new(), "close" => Vec::<f64>::new()).unwrap();
        let spec = StandardizeSpec {
            monetary: vec![UnitConversion {
                column: "amount".into(),
                unit: "wan".into(),
            }],
            unadjusted: vec!["close".into()],
            ..StandardizeSpec::default()
        };
        let out = Standardizer::standardize_all(&batch, &spec).unwrap();
        assert_eq!(out.height(), 0);
        assert!(frame::has_column(&out, "amount_wan"));
        assert!(frame::has_column(&out, "close_unadjusted"));
    }
}
