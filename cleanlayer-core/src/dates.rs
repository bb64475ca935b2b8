//! Lenient date parsing over heterogeneous column representations.
//!
//! Upstream sources hand us dates as `YYYY-MM-DD` strings, compact `YYYYMMDD`
//! strings or integers, and native date/datetime columns. Every value is parsed
//! on its own; anything unparseable becomes `None`.

use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_tz::Tz;
use polars::prelude::*;

/// Days from 0001-01-01 (CE) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Parse a single textual date.
pub fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(date_from_yyyymmdd);
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    // Datetime strings: "2024-01-05 09:30:00", "2024-01-05T09:30:00Z", ...
    if s.len() > 10 && s.is_char_boundary(10) {
        let (date_part, rest) = s.split_at(10);
        if rest.starts_with(' ') || rest.starts_with('T') {
            return NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok();
        }
    }
    None
}

/// Interpret an integer as `YYYYMMDD`.
pub fn date_from_yyyymmdd(value: i64) -> Option<NaiveDate> {
    if !(1_000_00_00..=9999_12_31).contains(&value) {
        return None;
    }
    let year = i32::try_from(value / 10_000).ok()?;
    let month = u32::try_from((value / 100) % 100).ok()?;
    let day = u32::try_from(value % 100).ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Encode a date as the integer `YYYYMMDD`.
pub fn to_yyyymmdd(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(date.year()) * 10_000 + i64::from(date.month()) * 100 + i64::from(date.day())
}

/// Milliseconds since the Unix epoch at midnight UTC of `date`.
pub fn to_epoch_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

/// Zone a tz-aware datetime column is read in. Naive columns are UTC.
#[derive(Debug, Clone, Copy)]
enum Zone {
    Utc,
    Named(Tz),
    Fixed(FixedOffset),
}

impl Zone {
    /// `None` when the zone name is neither an IANA name nor a fixed offset.
    fn parse(tz: Option<&str>) -> Option<Self> {
        let Some(name) = tz else {
            return Some(Zone::Utc);
        };
        if let Ok(tz) = name.parse::<Tz>() {
            return Some(Zone::Named(tz));
        }
        name.parse::<FixedOffset>().ok().map(Zone::Fixed)
    }
}

fn date_from_ticks(ticks: i64, unit: TimeUnit, zone: Zone) -> Option<NaiveDate> {
    let per_second = match unit {
        TimeUnit::Milliseconds => 1_000,
        TimeUnit::Microseconds => 1_000_000,
        TimeUnit::Nanoseconds => 1_000_000_000,
    };
    let utc = DateTime::from_timestamp(ticks.div_euclid(per_second), 0)?;
    Some(match zone {
        Zone::Utc => utc.date_naive(),
        Zone::Named(tz) => utc.with_timezone(&tz).date_naive(),
        Zone::Fixed(offset) => utc.with_timezone(&offset).date_naive(),
    })
}

/// Parse every value of `series` into a date. Length always equals the input.
pub fn parse_date_series(series: &Series) -> PolarsResult<Vec<Option<NaiveDate>>> {
    let parsed = match series.dtype() {
        DataType::String => series
            .str()?
            .into_iter()
            .map(|v| v.and_then(parse_date_str))
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
            .map(|v| v.and_then(date_from_yyyymmdd))
            .collect(),
        DataType::Float32 | DataType::Float64 => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| {
                v.filter(|x| x.is_finite() && x.fract() == 0.0)
                    .and_then(|x| date_from_yyyymmdd(x as i64))
            })
            .collect(),
        DataType::Date => series
            .cast(&DataType::Int32)?
            .i32()?
            .into_iter()
            .map(|v| v.and_then(date_from_epoch_days))
            .collect(),
        DataType::Datetime(unit, tz) => {
            let unit = *unit;
            // the calendar date is the one in the column's own zone
            let Some(zone) = Zone::parse(tz.as_ref().map(|t| t.as_str())) else {
                return Ok(vec![None; series.len()]);
            };
            series
                .cast(&DataType::Int64)?
                .i64()?
                .into_iter()
                .map(move |v| v.and_then(|t| date_from_ticks(t, unit, zone)))
                .collect()
        }
        _ => vec![None; series.len()],
    };
    Ok(parsed)
}
