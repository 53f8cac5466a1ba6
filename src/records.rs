//! Transformed records: one field on one target grid for one date.
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{DatasetConfig, FieldInfo};
use crate::error::{DateTimeError, RecordIoError};
use crate::grid::Grid;
use crate::source::Hemisphere;
use crate::time_bounds::TimeBoundsRule;

/// netCDF default fill for 32-bit floats
pub const NETCDF_FILL_F32: f32 = 9.969_209_968_386_869e36;
/// netCDF default fill for 64-bit floats
pub const NETCDF_FILL_F64: f64 = 9.969_209_968_386_869e36;
/// Fill value used in flat binary output
pub const BINARY_FILL: f64 = -9999.0;

pub const INTERPOLATION_PARAMETERS: &str = "bin averaging";
pub const EMPTY_RECORD_NOTE: &str = " -- empty record -- ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArrayPrecision {
    #[default]
    Float32,
    Float64,
}

impl ArrayPrecision {
    pub fn netcdf_fill(&self) -> f64 {
        match self {
            Self::Float32 => NETCDF_FILL_F32 as f64,
            Self::Float64 => NETCDF_FILL_F64,
        }
    }

    pub fn binary_fill(&self) -> f64 {
        BINARY_FILL
    }

    /// Big-endian dtype string for flat binary output
    pub fn binary_dtype(&self) -> &'static str {
        match self {
            Self::Float32 => ">f4",
            Self::Float64 => ">f8",
        }
    }

    /// Round a value to what this precision can store.
    pub fn round(&self, v: f64) -> f64 {
        match self {
            Self::Float32 => v as f32 as f64,
            Self::Float64 => v,
        }
    }
}

/// Whether `v` counts as missing: not finite, or equal to the fill value.
pub fn is_missing_value(v: f64, fill: f64) -> bool {
    !v.is_finite() || v == fill
}

/// The variable attributes attached to every transformed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAttributes {
    pub long_name: String,
    pub standard_name: String,
    pub units: String,
    pub valid_min: Option<f64>,
    pub valid_max: Option<f64>,
    pub original_field_name: String,
    #[serde(default)]
    pub original_filename: Option<String>,
    pub interpolation_date: NaiveDate,
    pub interpolation_parameters: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    /// `{field}_interpolated_to_{grid}`
    pub var_name: String,
    pub dataset: String,
    pub grid_name: String,
    pub field_name: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub hemisphere: Option<Hemisphere>,
    /// Shape `[1, grid dims...]`, fill-substituted
    pub values: ArrayD<f64>,
    pub time: NaiveDateTime,
    pub time_bounds: [NaiveDateTime; 2],
    pub fill_value: f64,
    pub precision: ArrayPrecision,
    pub attrs: RecordAttributes,
    #[serde(default)]
    pub global_attrs: IndexMap<String, Value>,
}

impl TransformedRecord {
    pub fn var_name_for(field: &str, grid: &str) -> String {
        format!("{field}_interpolated_to_{grid}")
    }

    pub fn is_missing(&self, v: f64) -> bool {
        is_missing_value(v, self.fill_value)
    }

    pub fn is_all_missing(&self) -> bool {
        self.values.iter().all(|&v| self.is_missing(v))
    }

    pub fn n_missing(&self) -> usize {
        self.values.iter().filter(|&&v| self.is_missing(v)).count()
    }

    /// The grid's native dimensions, without the leading time axis
    pub fn spatial_shape(&self) -> &[usize] {
        self.values.shape().get(1..).unwrap_or(&[])
    }

    /// Set `valid_min`/`valid_max` from the non-missing values; both are
    /// `None` if every value is missing.
    pub fn update_valid_range(&mut self) {
        let fill = self.fill_value;
        let (lo, hi) = self
            .values
            .iter()
            .copied()
            .filter(|&v| !is_missing_value(v, fill))
            .fold((None, None), |(lo, hi): (Option<f64>, Option<f64>), v| {
                (Some(lo.map_or(v, |l| l.min(v))), Some(hi.map_or(v, |h| h.max(v))))
            });
        self.attrs.valid_min = lo;
        self.attrs.valid_max = hi;
    }

    /// Round to the record's precision and replace every value that is not
    /// finite at that precision with the fill value.
    pub fn apply_fill(&mut self) {
        let fill = self.fill_value;
        let precision = self.precision;
        self.values.mapv_inplace(|v| {
            let r = precision.round(v);
            if r.is_finite() {
                r
            } else {
                fill
            }
        });
    }

    /// The values with missing cells as NaN
    pub fn values_with_nan(&self) -> ArrayD<f64> {
        let fill = self.fill_value;
        self.values
            .mapv(|v| if is_missing_value(v, fill) { f64::NAN } else { v })
    }
}

/// Builds records on one grid with identical shape and metadata scaffolding,
/// whether from mapped values or entirely missing.
pub struct EmptyRecordFactory<'a> {
    config: &'a DatasetConfig,
    grid: &'a Grid,
    bounds_rule: &'a dyn TimeBoundsRule,
}

impl<'a> EmptyRecordFactory<'a> {
    pub fn new(config: &'a DatasetConfig, grid: &'a Grid, bounds_rule: &'a dyn TimeBoundsRule) -> Self {
        Self {
            config,
            grid,
            bounds_rule,
        }
    }

    /// A record with every value missing.
    pub fn empty_record(
        &self,
        field: &FieldInfo,
        date: NaiveDate,
        hemisphere: Option<Hemisphere>,
        record_time: Option<NaiveDateTime>,
        notes: &str,
    ) -> Result<TransformedRecord, DateTimeError> {
        let values = ArrayD::from_elem(IxDyn(self.grid.shape()), f64::NAN);
        self.record_from_values(field, date, hemisphere, record_time, values, notes, None)
    }

    /// A record from values in the grid's native shape. Computes the valid
    /// range, substitutes fill values, sets the time coordinate and bounds,
    /// and stamps the dataset metadata. `values` should have the grid's shape
    /// so that all records in a series agree.
    #[allow(clippy::too_many_arguments)]
    pub fn record_from_values(
        &self,
        field: &FieldInfo,
        date: NaiveDate,
        hemisphere: Option<Hemisphere>,
        record_time: Option<NaiveDateTime>,
        values: ArrayD<f64>,
        notes: &str,
        original_filename: Option<String>,
    ) -> Result<TransformedRecord, DateTimeError> {
        let window = self
            .bounds_rule
            .window(date, record_time, self.config.data_time_scale)?;

        let mut record = TransformedRecord {
            var_name: TransformedRecord::var_name_for(&field.name, &self.grid.name),
            dataset: self.config.ds_name.clone(),
            grid_name: self.grid.name.clone(),
            field_name: field.name.clone(),
            date,
            hemisphere,
            values: values.insert_axis(Axis(0)),
            time: window.center(),
            time_bounds: window.as_array(),
            fill_value: self.config.array_precision.netcdf_fill(),
            precision: self.config.array_precision,
            attrs: RecordAttributes {
                long_name: field.long_name.clone(),
                standard_name: field.standard_name.clone(),
                units: field.units.clone(),
                valid_min: None,
                valid_max: None,
                original_field_name: field.name.clone(),
                original_filename,
                interpolation_date: Local::now().date_naive(),
                interpolation_parameters: INTERPOLATION_PARAMETERS.to_string(),
                notes: notes.to_string(),
            },
            global_attrs: IndexMap::new(),
        };

        // The valid range describes the stored values, so it is taken after rounding
        record.apply_fill();
        record.update_valid_range();
        stamp_dataset_metadata(&mut record, self.grid, self.config);
        Ok(record)
    }
}

/// Attach the dataset-level provenance attributes.
pub fn stamp_dataset_metadata(record: &mut TransformedRecord, grid: &Grid, config: &DatasetConfig) {
    let attrs = &mut record.global_attrs;
    attrs.insert("interpolated_grid".into(), grid.display_name().into());
    attrs.insert("interpolated_grid_id".into(), grid.name.clone().into());
    attrs.insert("grid_type".into(), grid.grid_type.clone().into());
    attrs.insert(
        "transformation_version".into(),
        config.transformation_version.0.into(),
    );
    attrs.insert(
        "time_coverage_resolution".into(),
        config.data_time_scale.coverage_resolution().into(),
    );
    attrs.insert("original_dataset_title".into(), config.original_dataset_title.clone().into());
    attrs.insert(
        "original_dataset_short_name".into(),
        config.original_dataset_short_name.clone().into(),
    );
    attrs.insert("original_dataset_url".into(), config.original_dataset_url.clone().into());
    attrs.insert(
        "original_dataset_reference".into(),
        config.original_dataset_reference.clone().into(),
    );
    attrs.insert("original_dataset_doi".into(), config.original_dataset_doi.clone().into());
    attrs.insert("notes".into(), config.notes.clone().into());
}

/// Persists transformed records. The encoding is up to the implementation.
pub trait RecordStore: Send + Sync {
    fn record_path(&self, record: &TransformedRecord, source_stem: &str) -> PathBuf;

    fn write(&self, record: &TransformedRecord, source_stem: &str) -> Result<PathBuf, RecordIoError>;

    fn read(&self, path: &Path) -> Result<TransformedRecord, RecordIoError>;
}

/// Stores records as JSON under
/// `{root}/{dataset}/transformed_products/{grid}/transformed/{field}/`.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    root: PathBuf,
}

impl JsonRecordStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl RecordStore for JsonRecordStore {
    fn record_path(&self, record: &TransformedRecord, source_stem: &str) -> PathBuf {
        self.root
            .join(&record.dataset)
            .join("transformed_products")
            .join(&record.grid_name)
            .join("transformed")
            .join(&record.field_name)
            .join(format!("{}_{}_{source_stem}.json", record.grid_name, record.field_name))
    }

    fn write(&self, record: &TransformedRecord, source_stem: &str) -> Result<PathBuf, RecordIoError> {
        let path = self.record_path(record, source_stem);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        }
        let text = serde_json::to_string(record).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        std::fs::write(&path, text).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        Ok(path)
    }

    fn read(&self, path: &Path) -> Result<TransformedRecord, RecordIoError> {
        let text = std::fs::read_to_string(path).map_err(|e| RecordIoError::could_not_read(path, e))?;
        serde_json::from_str(&text).map_err(|e| RecordIoError::could_not_read(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{daily_config, latlon_grid, test_field};
    use crate::time_bounds::CalendarWindow;
    use crate::utils::ymd;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_empty_record_scaffolding() {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 1.0, 2.0], &[10.0, 11.0], 100e3);
        let factory = EmptyRecordFactory::new(&config, &grid, &CalendarWindow);
        let rec = factory
            .empty_record(&test_field(), ymd(2010, 7, 3).unwrap(), None, None, EMPTY_RECORD_NOTE)
            .unwrap();

        assert_eq!(rec.values.shape(), &[1, 2, 3]);
        assert_eq!(rec.spatial_shape(), &[2, 3]);
        assert!(rec.is_all_missing());
        assert!(rec.values.iter().all(|&v| v == NETCDF_FILL_F32 as f64));
        assert_eq!(rec.attrs.valid_min, None);
        assert_eq!(rec.var_name, "sst_interpolated_to_g");
        assert_eq!(rec.time_bounds[0], ymd(2010, 7, 3).unwrap().and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(rec.time_bounds[1], ymd(2010, 7, 4).unwrap().and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(rec.global_attrs["interpolated_grid_id"], "g");
        assert_eq!(rec.attrs.notes, EMPTY_RECORD_NOTE);
    }

    #[test]
    fn test_valid_range_ignores_missing() {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 1.0], &[0.0], 100e3);
        let factory = EmptyRecordFactory::new(&config, &grid, &CalendarWindow);
        let values = ndarray::arr2(&[[f64::NAN, 2.5]]).into_dyn();
        let rec = factory
            .record_from_values(&test_field(), ymd(2010, 1, 1).unwrap(), None, None, values, "", None)
            .unwrap();
        assert_eq!(rec.attrs.valid_min, Some(2.5));
        assert_eq!(rec.attrs.valid_max, Some(2.5));
        assert!(rec.is_missing(rec.values[[0, 0, 0]]));
        assert_eq!(rec.n_missing(), 1);
        assert!(rec.values_with_nan()[[0, 0, 0]].is_nan());
    }

    #[test]
    fn test_valid_range_matches_stored_precision() {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 1.0, 2.0], &[0.0], 100e3);
        let factory = EmptyRecordFactory::new(&config, &grid, &CalendarWindow);
        // 0.1 and 1e39 are not representable as f32; the latter overflows
        let values = ndarray::arr2(&[[0.1, 0.7, 1e39]]).into_dyn();
        let rec = factory
            .record_from_values(&test_field(), ymd(2010, 1, 1).unwrap(), None, None, values, "", None)
            .unwrap();

        assert_eq!(rec.attrs.valid_min, Some(0.1f32 as f64));
        assert_eq!(rec.attrs.valid_max, Some(0.7f32 as f64));
        assert_eq!(rec.attrs.valid_min, Some(rec.values[[0, 0, 0]]));
        assert_eq!(rec.attrs.valid_max, Some(rec.values[[0, 0, 1]]));
        assert_eq!(rec.values[[0, 0, 2]], rec.fill_value);
    }

    #[test]
    fn test_float32_rounding() {
        assert_abs_diff_eq!(ArrayPrecision::Float32.round(0.1), 0.1f32 as f64);
        assert_eq!(ArrayPrecision::Float64.round(0.1), 0.1);
        assert_eq!(ArrayPrecision::Float64.binary_dtype(), ">f8");
    }

    #[test]
    fn test_json_store_path_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 1.0], &[0.0], 100e3);
        let factory = EmptyRecordFactory::new(&config, &grid, &CalendarWindow);
        let values = ndarray::arr2(&[[1.0, 2.0]]).into_dyn();
        let rec = factory
            .record_from_values(&test_field(), ymd(2010, 1, 1).unwrap(), None, None, values, "", None)
            .unwrap();

        let store = JsonRecordStore::new(dir.path());
        let path = store.write(&rec, "granule_20100101").unwrap();
        assert!(path.ends_with("TEST_DAILY/transformed_products/g/transformed/sst/g_sst_granule_20100101.json"));
        let back = store.read(&path).unwrap();
        assert_eq!(back, rec);
    }
}
