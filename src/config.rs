//! Per-dataset configuration.
//!
//! A dataset is described by a TOML file, e.g.:
//!
//! ```toml
//! ds_name = "EXAMPLE_SST_DAILY"
//! data_time_scale = "daily"
//! array_precision = "float32"
//! transformation_version = 1.2
//! mapping_operation = "mean"
//! pre_transformation_steps = ["mask_fill_values"]
//! notes = ""
//!
//! [source_grid]
//! resolution = "1/4"
//! area_extent = [-180.0, -90.0, 180.0, 90.0]
//! dims = [1440, 720]
//! data_max_lat = 80.0
//! projection = { type = "lat_lon" }
//!
//! [[fields]]
//! name = "analysed_sst"
//! long_name = "analysed sea surface temperature"
//! standard_name = "sea_surface_temperature"
//! units = "Celsius"
//! post_transformations = ["kelvin_to_celsius"]
//! ```
//!
//! Datasets split into two files per date use a `[hemispheres]` table with
//! `north` and `south` entries (each with a filename `pattern` and a `grid`)
//! instead of `[source_grid]`.
//!
//! [`DatasetConfig::load`] reads the file with `figment`, so the top-level
//! scalars listed in [`ENV_OVERRIDABLE_KEYS`] can also be overridden from the
//! environment with the `GRANULE_REGRID_` prefix (e.g. `GRANULE_REGRID_WORKERS=4`).
use std::fmt::Display;
use std::hash::Hash;
use std::path::Path;

use error_stack::ResultExt;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{de::Error as _, Deserialize, Serialize};

use crate::hooks::HookRegistry;
use crate::mapper::ReductionOp;
use crate::records::ArrayPrecision;
use crate::source::Hemisphere;
use crate::spatial_index::SourceGridSpec;
use crate::time_bounds::{TimeBoundsOverride, TimeScale};

pub const ENV_PREFIX: &str = "GRANULE_REGRID_";

/// Top-level keys that may be overridden from the environment. Other
/// variables with [`ENV_PREFIX`] are ignored rather than rejected as unknown keys.
pub const ENV_OVERRIDABLE_KEYS: &[&str] = &[
    "workers",
    "array_precision",
    "mapping_operation",
    "monthly_tolerance",
    "transformation_version",
    "max_neighbours",
    "transpose",
    "do_monthly_aggregation",
    "time_bounds_override",
    "notes",
];
pub const DEFAULT_MONTHLY_TOLERANCE: u32 = 8;
pub const DEFAULT_MAX_NEIGHBOURS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {0} does not exist")]
    NotFound(String),
    #[error("Could not parse the configuration: {0}")]
    Parse(String),
    #[error("Unknown {stage}-transformation hook '{name}'")]
    UnknownHook { stage: &'static str, name: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid<S: ToString>(msg: S) -> Self {
        Self::Invalid(msg.to_string())
    }
}

/// The version of the transformation code; part of the factors cache key and
/// of provenance, so bumping it forces both to be regenerated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformationVersion(pub f64);

impl PartialEq for TransformationVersion {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for TransformationVersion {}

impl Hash for TransformationVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl Display for TransformationVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One field of the source dataset to transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldInfo {
    /// Variable name in the source granule
    pub name: String,
    pub long_name: String,
    pub standard_name: String,
    pub units: String,
    /// Hooks run on the source dataset for this field only, after the dataset-level ones
    #[serde(default)]
    pub pre_transformations: Vec<String>,
    /// Hooks run on the mapped field for this field only, after the dataset-level ones
    #[serde(default)]
    pub post_transformations: Vec<String>,
}

impl FieldInfo {
    pub fn new<S: Into<String>>(name: S, long_name: S, standard_name: S, units: S) -> Self {
        Self {
            name: name.into(),
            long_name: long_name.into(),
            standard_name: standard_name.into(),
            units: units.into(),
            pre_transformations: vec![],
            post_transformations: vec![],
        }
    }
}

/// A regular expression matched against granule file names. It is compiled
/// once, when the configuration is parsed, so a bad pattern is a parse error.
#[derive(Debug, Clone)]
pub struct FilenamePattern(regex::Regex);

impl FilenamePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self(regex::Regex::new(pattern)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, file_name: &str) -> bool {
        self.0.is_match(file_name)
    }
}

impl PartialEq for FilenamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for FilenamePattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FilenamePattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern)
            .map_err(|e| D::Error::custom(format!("bad hemisphere pattern '{pattern}': {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HemisphereSource {
    /// Matched against the granule file name
    pub pattern: FilenamePattern,
    pub grid: SourceGridSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HemisphereConfig {
    pub north: HemisphereSource,
    pub south: HemisphereSource,
    /// Whose value is kept when both hemispheres have data at the same cell
    #[serde(default = "default_primary")]
    pub primary: Hemisphere,
}

fn default_primary() -> Hemisphere {
    Hemisphere::North
}

fn default_tolerance() -> u32 {
    DEFAULT_MONTHLY_TOLERANCE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub ds_name: String,
    pub fields: Vec<FieldInfo>,
    pub data_time_scale: TimeScale,
    pub transformation_version: TransformationVersion,

    #[serde(default)]
    pub array_precision: ArrayPrecision,
    #[serde(default)]
    pub mapping_operation: ReductionOp,
    #[serde(default = "default_tolerance")]
    pub monthly_tolerance: u32,
    #[serde(default)]
    pub pre_transformation_steps: Vec<String>,
    #[serde(default)]
    pub post_transformation_steps: Vec<String>,

    #[serde(default)]
    pub source_grid: Option<SourceGridSpec>,
    #[serde(default)]
    pub hemispheres: Option<HemisphereConfig>,

    #[serde(default)]
    pub transpose: bool,
    #[serde(default)]
    pub max_neighbours: Option<usize>,
    #[serde(default)]
    pub time_bounds_override: Option<TimeBoundsOverride>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub do_monthly_aggregation: bool,

    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub original_dataset_title: String,
    #[serde(default)]
    pub original_dataset_short_name: String,
    #[serde(default)]
    pub original_dataset_url: String,
    #[serde(default)]
    pub original_dataset_reference: String,
    #[serde(default)]
    pub original_dataset_doi: String,
}

impl DatasetConfig {
    /// Load a dataset configuration from a TOML file, with environment overrides.
    ///
    /// This only parses the file; call [`DatasetConfig::validate`] before using it.
    pub fn load(path: &Path) -> error_stack::Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()).into());
        }

        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).only(ENV_OVERRIDABLE_KEYS))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .attach_printable_lazy(|| format!("while loading {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the configuration for problems that would otherwise only show up
    /// partway through a run, most importantly unknown hook names.
    pub fn validate(&self, hooks: &HookRegistry) -> Result<(), ConfigError> {
        if self.fields.is_empty() {
            return Err(ConfigError::invalid(format!("dataset {} lists no fields", self.ds_name)));
        }

        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(ConfigError::invalid(format!("field '{}' is listed twice", field.name)));
            }
            hooks.resolve_pre(&self.pre_steps_for(field))?;
            hooks.resolve_post(&self.post_steps_for(field))?;
        }

        match (&self.source_grid, &self.hemispheres) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::invalid(
                    "only one of source_grid and hemispheres may be given",
                ))
            }
            (None, None) => {
                return Err(ConfigError::invalid(
                    "one of source_grid or hemispheres must be given",
                ))
            }
            (Some(grid), None) => grid.validate()?,
            (None, Some(hemis)) => {
                hemis.north.grid.validate()?;
                hemis.south.grid.validate()?;
            }
        }

        if self.workers == Some(0) {
            return Err(ConfigError::invalid("workers must be at least 1"));
        }

        if self.max_neighbours == Some(0) {
            return Err(ConfigError::invalid("max_neighbours must be at least 1"));
        }

        Ok(())
    }

    /// Dataset-level pre-transformation hooks followed by the field's own.
    pub fn pre_steps_for(&self, field: &FieldInfo) -> Vec<String> {
        self.pre_transformation_steps
            .iter()
            .chain(field.pre_transformations.iter())
            .cloned()
            .collect()
    }

    /// Dataset-level post-transformation hooks followed by the field's own.
    pub fn post_steps_for(&self, field: &FieldInfo) -> Vec<String> {
        self.post_transformation_steps
            .iter()
            .chain(field.post_transformations.iter())
            .cloned()
            .collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The source grid description for a granule of the given hemisphere.
    pub fn source_grid_for(&self, hemisphere: Option<Hemisphere>) -> Result<&SourceGridSpec, ConfigError> {
        match (hemisphere, &self.source_grid, &self.hemispheres) {
            (None, Some(grid), _) => Ok(grid),
            (Some(Hemisphere::North), _, Some(h)) => Ok(&h.north.grid),
            (Some(Hemisphere::South), _, Some(h)) => Ok(&h.south.grid),
            (Some(hemi), _, None) => Err(ConfigError::invalid(format!(
                "granule is tagged with hemisphere {hemi} but {} has no hemispheres table",
                self.ds_name
            ))),
            (None, None, _) => Err(ConfigError::invalid(format!(
                "granule has no hemisphere but {} has no source_grid table",
                self.ds_name
            ))),
        }
    }

    /// Infer the hemisphere from a granule file name using the configured patterns.
    pub fn detect_hemisphere(&self, file_name: &str) -> Option<Hemisphere> {
        let hemis = self.hemispheres.as_ref()?;
        if hemis.north.pattern.is_match(file_name) {
            Some(Hemisphere::North)
        } else if hemis.south.pattern.is_match(file_name) {
            Some(Hemisphere::South)
        } else {
            None
        }
    }

    pub fn primary_hemisphere(&self) -> Hemisphere {
        self.hemispheres
            .as_ref()
            .map(|h| h.primary)
            .unwrap_or(Hemisphere::North)
    }

    pub fn max_neighbours(&self) -> usize {
        self.max_neighbours.unwrap_or(DEFAULT_MAX_NEIGHBOURS)
    }

    /// The worker pool size: the configured value, or half the available
    /// parallelism (at least 1).
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1)
        })
    }
}
