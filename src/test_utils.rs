//! Synthetic grids, configurations and catalog documents for unit tests.
use std::path::Path;

use ndarray::{Array2, ArrayD, IxDyn};

use crate::catalog::{Document, TransformationProvenance};
use crate::config::{DatasetConfig, FieldInfo, TransformationVersion};
use crate::grid::Grid;
use crate::source::SourceRecord;

/// A daily dataset with one field ("sst") on a 12 x 2 one-degree source grid
/// spanning 1W-11E, 1S-1N.
pub(crate) fn daily_config_toml() -> String {
    r#"
ds_name = "TEST_DAILY"
data_time_scale = "daily"
transformation_version = 1.0
notes = ""
original_dataset_title = "Test dataset"
original_dataset_short_name = "TEST"

[source_grid]
resolution = 1.0
area_extent = [-1.0, -1.0, 11.0, 1.0]
dims = [12, 2]

[[fields]]
name = "sst"
long_name = "sea surface temperature"
standard_name = "sea_surface_temperature"
units = "Celsius"
"#
    .to_string()
}

pub(crate) fn daily_config() -> DatasetConfig {
    DatasetConfig::from_toml_str(&daily_config_toml()).expect("test config should parse")
}

pub(crate) fn monthly_config() -> DatasetConfig {
    let toml = daily_config_toml()
        .replace("TEST_DAILY", "TEST_MONTHLY")
        .replace("\"daily\"", "\"monthly\"");
    DatasetConfig::from_toml_str(&toml).expect("test config should parse")
}

/// The daily test dataset split into hemisphere files matched by "_nh_"/"_sh_".
pub(crate) fn hemisphere_config_toml() -> String {
    r#"
ds_name = "TEST_HEMI"
data_time_scale = "daily"
transformation_version = 1.0

[hemispheres.north]
pattern = "_nh_"
grid = { resolution = 1.0, area_extent = [-1.0, 0.0, 11.0, 1.0], dims = [12, 1] }

[hemispheres.south]
pattern = "_sh_"
grid = { resolution = 1.0, area_extent = [-1.0, -1.0, 11.0, 0.0], dims = [12, 1] }

[[fields]]
name = "sst"
long_name = "sea surface temperature"
standard_name = "sea_surface_temperature"
units = "Celsius"
"#
    .to_string()
}

pub(crate) fn hemisphere_config() -> DatasetConfig {
    DatasetConfig::from_toml_str(&hemisphere_config_toml()).expect("test config should parse")
}

pub(crate) fn test_field() -> FieldInfo {
    FieldInfo::new("sst", "sea surface temperature", "sea_surface_temperature", "Celsius")
}

/// A lat-lon grid of shape `[lats.len(), lons.len()]` with a constant
/// `effective_grid_radius`.
pub(crate) fn latlon_grid(name: &str, lons: &[f64], lats: &[f64], radius: f64) -> Grid {
    let shape = (lats.len(), lons.len());
    let xc = Array2::from_shape_fn(shape, |(_, i)| lons[i]).into_dyn();
    let yc = Array2::from_shape_fn(shape, |(j, _)| lats[j]).into_dyn();
    let r = ArrayD::from_elem(IxDyn(&[shape.0, shape.1]), radius);
    Grid::new(name, "latlon", xc, yc).with_field("effective_grid_radius", r)
}

pub(crate) fn source_record(path: &str, date: &str, checksum: &str) -> SourceRecord {
    SourceRecord {
        id: None,
        dataset: "TEST_DAILY".to_string(),
        pre_transformation_file_path: Some(path.into()),
        date: date.to_string(),
        checksum: checksum.to_string(),
        hemisphere: None,
        file_size: None,
        filename: None,
        harvest_success: true,
    }
}

pub(crate) fn granule_doc(dataset: &str, path: &str, date: &str, checksum: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("type".into(), "granule".into());
    doc.insert("dataset".into(), dataset.into());
    doc.insert("pre_transformation_file_path".into(), path.into());
    doc.insert("date".into(), date.into());
    doc.insert("checksum".into(), checksum.into());
    doc.insert("harvest_success".into(), true.into());
    doc
}

pub(crate) fn provenance(dataset: &str, grid: &str, field: &str, path: &str, date: &str) -> TransformationProvenance {
    TransformationProvenance {
        id: None,
        dataset: dataset.to_string(),
        grid_name: grid.to_string(),
        field: field.to_string(),
        pre_transformation_file_path: Path::new(path).to_path_buf(),
        date: date.to_string(),
        hemisphere: None,
        origin_checksum: "abc".to_string(),
        transformation_version: Some(TransformationVersion(1.0)),
        success: true,
        transformation_in_progress: false,
        transformation_file_path: None,
        transformation_checksum: None,
        transformation_completed: None,
    }
}
