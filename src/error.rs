//! Common errors across the granule-regrid crate
//!
//! Each module owns the error type for its own failures; this module holds the
//! ones shared by several stages plus [`TransformError`], the taxonomy used to
//! decide how far a failure is allowed to spread (one field, one grid, or one
//! granule, never the whole run).
use std::path::PathBuf;

use crate::factors::FactorsKey;

/// Errors related to working with dates
#[derive(Debug, thiserror::Error)]
pub enum DateTimeError {
    #[error("Year {0}, month {1}, day {2} is not a valid date")]
    InvalidYearMonthDay(i32, u32, u32),
    #[error("Could not parse '{0}' as a date")]
    Unparseable(String),
    #[error("Adding or subtracting {0} to {1} went outside the representable date range")]
    OutOfRange(String, String),
}

impl DateTimeError {
    pub fn out_of_range<A: ToString, B: ToString>(delta: A, start: B) -> Self {
        Self::OutOfRange(delta.to_string(), start.to_string())
    }
}

/// The outcome categories for a failed piece of a transformation.
///
/// Which variant is produced determines both the containment unit and
/// the success flag recorded in provenance:
///
/// - `UnsupportedGrid` and `CacheBuildFailure` skip one grid for the current
///   granule and leave its provenance unset,
/// - `MissingSourceVariable` substitutes an empty record but counts as a
///   *successful* attempt,
/// - `MappingFailure` and `HookFailure` substitute an empty record and count
///   as failed,
/// - `Catalog` is logged and otherwise ignored.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Grid '{grid}' has none of the recognized radius fields")]
    UnsupportedGrid { grid: String },
    #[error("Mapping failed: {0}")]
    MappingFailure(String),
    #[error("Variable '{field}' is not present in the source dataset")]
    MissingSourceVariable { field: String },
    #[error("Hook '{hook}' failed: {reason}")]
    HookFailure { hook: String, reason: String },
    #[error("Could not build or persist mapping factors for {key}")]
    CacheBuildFailure { key: FactorsKey },
    #[error("Catalog request failed: {0}")]
    Catalog(String),
}

impl TransformError {
    pub fn unsupported_grid<S: Into<String>>(grid: S) -> Self {
        Self::UnsupportedGrid { grid: grid.into() }
    }

    pub fn mapping_failure<S: ToString>(reason: S) -> Self {
        Self::MappingFailure(reason.to_string())
    }

    pub fn missing_source_variable<S: Into<String>>(field: S) -> Self {
        Self::MissingSourceVariable { field: field.into() }
    }

    pub fn hook_failure<H: Into<String>, R: ToString>(hook: H, reason: R) -> Self {
        Self::HookFailure {
            hook: hook.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors reading or writing the persisted transformed records.
#[derive(Debug, thiserror::Error)]
pub enum RecordIoError {
    #[error("Could not write record to {}: {reason}", .path.display())]
    CouldNotWrite { path: PathBuf, reason: String },
    #[error("Could not read record from {}: {reason}", .path.display())]
    CouldNotRead { path: PathBuf, reason: String },
    #[error("Record in {} has shape {actual:?}, expected {expected:?}", .path.display())]
    WrongShape {
        path: PathBuf,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl RecordIoError {
    pub fn could_not_write<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Self::CouldNotWrite {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn could_not_read<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Self::CouldNotRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
