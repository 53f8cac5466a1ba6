//! Source granules: their catalog metadata and their contents.
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::DateTimeError;
use crate::utils;

/// Which half of a hemispherically split dataset a granule covers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Hemisphere {
    #[serde(rename = "nh", alias = "north")]
    #[strum(to_string = "nh", serialize = "north")]
    North,
    #[serde(rename = "sh", alias = "south")]
    #[strum(to_string = "sh", serialize = "south")]
    South,
}

impl Hemisphere {
    pub fn other(&self) -> Self {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Could not open source granule {}: {reason}", .path.display())]
    CouldNotOpen { path: PathBuf, reason: String },
    #[error("Variable '{name}' in {} is inconsistent: {reason}", .path.display())]
    BadVariable {
        path: PathBuf,
        name: String,
        reason: String,
    },
}

/// A harvested source granule, as described by its catalog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub dataset: String,
    /// Local path of the harvested file; may be absent if harvesting failed
    #[serde(default)]
    pub pre_transformation_file_path: Option<PathBuf>,
    /// ISO 8601 date string, e.g. "2010-07-03T00:00:00Z"
    pub date: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hemisphere: Option<Hemisphere>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub harvest_success: bool,
}

impl SourceRecord {
    pub fn date(&self) -> Result<NaiveDate, DateTimeError> {
        utils::parse_catalog_date(&self.date)
    }

    /// The file name to use for hemisphere detection and output naming:
    /// the `filename` field if set, otherwise the last path component.
    pub fn file_name(&self) -> Option<String> {
        self.filename.clone().or_else(|| {
            self.pre_transformation_file_path
                .as_deref()
                .and_then(Path::file_name)
                .map(|s| s.to_string_lossy().to_string())
        })
    }
}

/// The contents of a granule: named n-dimensional variables plus the
/// granule's own time stamp, if it carries one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDataset {
    #[serde(default)]
    pub variables: IndexMap<String, ArrayD<f64>>,
    #[serde(default)]
    pub time: Option<NaiveDateTime>,
    #[serde(default)]
    pub attrs: IndexMap<String, serde_json::Value>,
}

impl SourceDataset {
    pub fn with_variable<S: Into<String>>(mut self, name: S, values: ArrayD<f64>) -> Self {
        self.variables.insert(name.into(), values);
        self
    }

    pub fn with_time(mut self, time: NaiveDateTime) -> Self {
        self.time = Some(time);
        self
    }
}

/// Opens source granules. The on-disk format is up to the implementation.
pub trait SourceReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<SourceDataset, SourceError>;
}

/// Reads granules stored as JSON-serialized [`SourceDataset`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSourceReader;

impl SourceReader for JsonSourceReader {
    fn open(&self, path: &Path) -> Result<SourceDataset, SourceError> {
        let text = std::fs::read_to_string(path).map_err(|e| SourceError::CouldNotOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| SourceError::CouldNotOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_hemisphere_names() {
        assert_eq!(Hemisphere::North.to_string(), "nh");
        assert_eq!(Hemisphere::from_str("south").unwrap(), Hemisphere::South);
        assert_eq!(Hemisphere::from_str("sh").unwrap(), Hemisphere::South);
        let h: Hemisphere = serde_json::from_str("\"north\"").unwrap();
        assert_eq!(h, Hemisphere::North);
        assert_eq!(serde_json::to_string(&Hemisphere::South).unwrap(), "\"sh\"");
    }

    #[test]
    fn test_source_record_from_catalog_doc() {
        let doc = serde_json::json!({
            "type": "granule",
            "dataset": "TEST",
            "pre_transformation_file_path": "/data/TEST/granule_20100703.json",
            "date": "2010-07-03T00:00:00Z",
            "checksum": "abc123",
            "harvest_success": true
        });
        let rec: SourceRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(rec.date().unwrap(), NaiveDate::from_ymd_opt(2010, 7, 3).unwrap());
        assert_eq!(rec.file_name().as_deref(), Some("granule_20100703.json"));
        assert!(rec.hemisphere.is_none());
    }
}
