//! General utilities, not particular to any one pipeline stage.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{Datelike, Months, NaiveDate};

use crate::error::DateTimeError;

/// Compute the SHA-256 checksum of a file, returned as a lowercase hex string.
///
/// This is what gets recorded as `transformation_checksum` in provenance so that
/// a transformed file that was changed on disk can be identified later.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut context = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.update(&buffer[..n]);
    }
    Ok(hex::encode(context.finish().as_ref()))
}

/// Construct a date, returning a [`DateTimeError`] rather than `None` if invalid.
pub fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate, DateTimeError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(DateTimeError::InvalidYearMonthDay(year, month, day))
}

/// The first day of the month containing `date`.
pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    // Day 1 always exists, so with_day(1) cannot fail.
    date.with_day(1).unwrap_or(date)
}

/// The first day of the month after the one containing `date`.
///
/// December rolls over into January of the following year.
pub fn first_of_next_month(date: NaiveDate) -> Result<NaiveDate, DateTimeError> {
    first_of_month(date)
        .checked_add_months(Months::new(1))
        .ok_or_else(|| DateTimeError::out_of_range("1 month", date))
}

/// Parse the leading `YYYY-MM-DD` portion of a catalog date string.
///
/// Catalog dates are stored as ISO 8601 strings which may carry a time and
/// a trailing "Z" (e.g. "2001-03-15T00:00:00Z"); only the date part matters here.
pub fn parse_catalog_date(s: &str) -> Result<NaiveDate, DateTimeError> {
    let date_part = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| DateTimeError::Unparseable(s.to_string()))
}

/// Format a date the way it is stored in the catalog's `date` field.
pub fn catalog_date_string(date: NaiveDate) -> String {
    date.format("%Y-%m-%dT00:00:00Z").to_string()
}

/// The file name of `path` without its final extension, or an empty string
/// if it has no file name.
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
