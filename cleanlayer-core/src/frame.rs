//! Small helpers over polars frames shared by the stages.

use crate::schema::ColumnType;
use polars::prelude::*;
use std::collections::{HashMap, HashSet};

/// Key tuple of one row; `None` marks a null cell.
pub type KeyTuple = Vec<Option<String>>;

/// Which occurrence of a repeated key survives deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepStrategy {
    First,
    #[default]
    Last,
}

/// Column names in frame order.
pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

/// Logical family of a polars dtype, if it maps onto one.
pub fn logical_type(dtype: &DataType) -> Option<ColumnType> {
    match dtype {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Some(ColumnType::Integer),
        DataType::Float32 | DataType::Float64 => Some(ColumnType::Float),
        DataType::String => Some(ColumnType::Text),
        DataType::Boolean => Some(ColumnType::Boolean),
        DataType::Date | DataType::Datetime(_, _) => Some(ColumnType::Timestamp),
        _ => None,
    }
}

pub fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        logical_type(dtype),
        Some(ColumnType::Integer | ColumnType::Float)
    )
}

/// Nulls plus NaNs for float columns.
pub fn missing_value_count(series: &Series) -> PolarsResult<usize> {
    let nulls = series.null_count();
    let nans = match series.dtype() {
        DataType::Float32 | DataType::Float64 => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .filter(|v| v.is_some_and(f64::is_nan))
            .count(),
        _ => 0,
    };
    Ok(nulls + nans)
}

/// Row-wise key tuples over `keys`, rendered as text.
pub fn key_tuples(df: &DataFrame, keys: &[String]) -> PolarsResult<Vec<KeyTuple>> {
    let mut rendered = Vec::with_capacity(keys.len());
    for key in keys {
        let as_text = df
            .column(key)?
            .as_materialized_series()
            .cast(&DataType::String)?;
        let values: Vec<Option<String>> = as_text
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_owned))
            .collect();
        rendered.push(values);
    }

    let rows = (0..df.height())
        .map(|i| rendered.iter().map(|col| col[i].clone()).collect())
        .collect();
    Ok(rows)
}

/// Positions of rows whose key tuple already appeared earlier.
pub fn later_duplicate_positions(tuples: &[KeyTuple]) -> Vec<usize> {
    let mut seen: HashSet<&KeyTuple> = HashSet::with_capacity(tuples.len());
    tuples
        .iter()
        .enumerate()
        .filter_map(|(i, t)| (!seen.insert(t)).then_some(i))
        .collect()
}

/// Mask keeping exactly one row per distinct key tuple.
pub fn keep_mask(tuples: &[KeyTuple], keep: KeepStrategy) -> Vec<bool> {
    let mut chosen: HashMap<&KeyTuple, usize> = HashMap::with_capacity(tuples.len());
    for (i, t) in tuples.iter().enumerate() {
        match keep {
            KeepStrategy::First => {
                chosen.entry(t).or_insert(i);
            }
            KeepStrategy::Last => {
                chosen.insert(t, i);
            }
        }
    }
    let mut mask = vec![false; tuples.len()];
    for &i in chosen.values() {
        mask[i] = true;
    }
    mask
}

/// Keep rows where `mask` is true, preserving order.
pub fn filter_rows(df: &DataFrame, mask: &[bool]) -> PolarsResult<DataFrame> {
    let mask = BooleanChunked::from_slice("mask".into(), mask);
    df.filter(&mask)
}
