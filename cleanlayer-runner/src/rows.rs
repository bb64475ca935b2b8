//! Row-major view of a frame chunk, the unit handed to a destination store.

use polars::prelude::*;
use std::fmt;

/// Storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Integer,
    Float,
    Text,
    Boolean,
}

impl CellKind {
    fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::Boolean => CellKind::Boolean,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => CellKind::Integer,
            DataType::Float32 | DataType::Float64 => CellKind::Float,
            _ => CellKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Integer(v) => write!(f, "{v}"),
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Text(v) => f.write_str(v),
            CellValue::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Rows of one chunk with their column names and storage classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChunk {
    pub columns: Vec<String>,
    pub kinds: Vec<CellKind>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RowChunk {
    /// Convert a frame. Dates and other non-primitive types become text; NaN
    /// becomes null.
    pub fn from_frame(df: &DataFrame) -> PolarsResult<Self> {
        let mut columns = Vec::with_capacity(df.width());
        let mut kinds = Vec::with_capacity(df.width());
        let mut values: Vec<Vec<CellValue>> = Vec::with_capacity(df.width());

        for column in df.get_columns() {
            let series = column.as_materialized_series();
            let kind = CellKind::of(series.dtype());
            let cells: Vec<CellValue> = match kind {
                CellKind::Boolean => series
                    .bool()?
                    .into_iter()
                    .map(|v| v.map_or(CellValue::Null, CellValue::Boolean))
                    .collect(),
                CellKind::Integer => series
                    .cast(&DataType::Int64)?
                    .i64()?
                    .into_iter()
                    .map(|v| v.map_or(CellValue::Null, CellValue::Integer))
                    .collect(),
                CellKind::Float => series
                    .cast(&DataType::Float64)?
                    .f64()?
                    .into_iter()
                    .map(|v| match v {
                        Some(x) if !x.is_nan() => CellValue::Float(x),
                        _ => CellValue::Null,
                    })
                    .collect(),
                CellKind::Text => series
                    .cast(&DataType::String)?
                    .str()?
                    .into_iter()
                    .map(|v| v.map_or(CellValue::Null, |s| CellValue::Text(s.to_string())))
                    .collect(),
            };
            columns.push(series.name().to_string());
            kinds.push(kind);
            values.push(cells);
        }

        let rows = (0..df.height())
            .map(|i| values.iter().map(|col| col[i].clone()).collect())
            .collect();
        Ok(Self {
            columns,
            kinds,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}
