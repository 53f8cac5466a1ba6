//! Target (model) grid definitions.
//!
//! A [`Grid`] is a named set of target points given by the `xc` (longitude) and
//! `yc` (latitude) arrays, in whatever native layout the model uses (2-D for a
//! lat-lon grid, 3-D tiles for an LLC grid, ...). Besides coordinates, a grid
//! carries auxiliary fields, one of which must define the effective radius of
//! each cell. The accepted fields, in order of preference, are listed in
//! [`RADIUS_SOURCES`].
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use log::debug;
use ndarray::{Array1, ArrayD};
use serde::{Deserialize, Serialize};

/// The grid fields from which the per-point search radius can be derived,
/// checked in this order.
pub const RADIUS_SOURCES: [RadiusSource; 4] = [
    RadiusSource::EffectiveGridRadius,
    RadiusSource::EffectiveRadius,
    RadiusSource::Rad,
    RadiusSource::CellArea,
];

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// The grid exposes none of the fields in [`RADIUS_SOURCES`]
    #[error("Grid '{grid}' is not supported: it has none of the fields effective_grid_radius, effective_radius, RAD, or rA")]
    Unsupported { grid: String },
    #[error("No grid named '{0}' is available")]
    NotFound(String),
    #[error("Could not read grid file {}: {reason}", .path.display())]
    CouldNotRead { path: PathBuf, reason: String },
    #[error("Grid '{grid}' is inconsistent: {reason}")]
    Inconsistent { grid: String, reason: String },
}

impl GridError {
    pub fn unsupported<S: Into<String>>(grid: S) -> Self {
        Self::Unsupported { grid: grid.into() }
    }

    pub fn inconsistent<G: Into<String>, R: ToString>(grid: G, reason: R) -> Self {
        Self::Inconsistent {
            grid: grid.into(),
            reason: reason.to_string(),
        }
    }
}

/// Which grid field defines the effective radius of each target cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RadiusSource {
    /// `effective_grid_radius`, in meters
    #[strum(serialize = "effective_grid_radius")]
    EffectiveGridRadius,
    /// `effective_radius`, in meters
    #[strum(serialize = "effective_radius")]
    EffectiveRadius,
    /// `RAD`, in meters
    #[strum(serialize = "RAD")]
    Rad,
    /// `rA`, the cell area in square meters; the radius is half its square root
    #[strum(serialize = "rA")]
    CellArea,
}

impl RadiusSource {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::EffectiveGridRadius => "effective_grid_radius",
            Self::EffectiveRadius => "effective_radius",
            Self::Rad => "RAD",
            Self::CellArea => "rA",
        }
    }

    fn to_radius(&self, value: f64) -> f64 {
        match self {
            Self::CellArea => 0.5 * value.sqrt(),
            _ => value,
        }
    }
}

/// A target grid. Immutable once loaded and shared read-only between jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    pub name: String,
    #[serde(rename = "type")]
    pub grid_type: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Longitude of each target point, degrees east
    pub xc: ArrayD<f64>,
    /// Latitude of each target point, degrees north
    pub yc: ArrayD<f64>,
    #[serde(default)]
    pub fields: IndexMap<String, ArrayD<f64>>,
}

impl Grid {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, grid_type: T, xc: ArrayD<f64>, yc: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            grid_type: grid_type.into(),
            title: None,
            xc,
            yc,
            fields: IndexMap::new(),
        }
    }

    pub fn with_field<S: Into<String>>(mut self, name: S, values: ArrayD<f64>) -> Self {
        self.fields.insert(name.into(), values);
        self
    }

    /// The native shape of the grid's point layout
    pub fn shape(&self) -> &[usize] {
        self.xc.shape()
    }

    /// The number of target points
    pub fn len(&self) -> usize {
        self.xc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xc.is_empty()
    }

    /// The title if there is one, otherwise the name. Used for the
    /// `interpolated_grid` attribute.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// Longitudes in row-major (flattened) order
    pub fn lons_flat(&self) -> Vec<f64> {
        self.xc.iter().copied().collect()
    }

    /// Latitudes in row-major (flattened) order
    pub fn lats_flat(&self) -> Vec<f64> {
        self.yc.iter().copied().collect()
    }

    /// Check that coordinates and any radius field agree in shape.
    pub fn validate(&self) -> Result<(), GridError> {
        if self.xc.shape() != self.yc.shape() {
            return Err(GridError::inconsistent(
                &self.name,
                format!("xc shape {:?} differs from yc shape {:?}", self.xc.shape(), self.yc.shape()),
            ));
        }
        if let Some(source) = self.radius_source() {
            let n = self.fields[source.field_name()].len();
            if n != self.len() {
                return Err(GridError::inconsistent(
                    &self.name,
                    format!("{source} has {n} values but the grid has {} points", self.len()),
                ));
            }
        }
        Ok(())
    }

    /// The first recognized radius-defining field present on this grid, if any.
    pub fn radius_source(&self) -> Option<RadiusSource> {
        RADIUS_SOURCES
            .iter()
            .copied()
            .find(|src| self.fields.contains_key(src.field_name()))
    }

    /// The effective search radius of each target point in meters, flattened.
    ///
    /// Returns [`GridError::Unsupported`] if the grid has no recognized
    /// radius field; the caller is expected to skip this grid.
    pub fn effective_radius(&self) -> Result<Array1<f64>, GridError> {
        let source = self
            .radius_source()
            .ok_or_else(|| GridError::unsupported(&self.name))?;
        let raw = &self.fields[source.field_name()];
        if raw.len() != self.len() {
            return Err(GridError::inconsistent(
                &self.name,
                format!("{source} has {} values but the grid has {} points", raw.len(), self.len()),
            ));
        }
        Ok(raw.iter().map(|&v| source.to_radius(v)).collect())
    }
}

/// A read-mostly source of target grids, shared by all jobs in a run.
pub trait GridStore: Send + Sync {
    /// Load (or return the already-loaded) grid with this name.
    fn load(&self, name: &str) -> Result<Arc<Grid>, GridError>;

    /// Names of all grids this store can provide.
    fn available(&self) -> Result<Vec<String>, GridError>;
}

/// Grids stored as `<name>.json` files in one directory.
///
/// Each grid is read from disk at most once per store; later calls hand out
/// the same `Arc`.
pub struct DirGridStore {
    dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<Grid>>>,
}

impl DirGridStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn grid_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_grid(&self, path: &Path) -> Result<Grid, GridError> {
        let text = std::fs::read_to_string(path).map_err(|e| GridError::CouldNotRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let grid: Grid = serde_json::from_str(&text).map_err(|e| GridError::CouldNotRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        grid.validate()?;
        Ok(grid)
    }
}

impl GridStore for DirGridStore {
    fn load(&self, name: &str) -> Result<Arc<Grid>, GridError> {
        if let Ok(cache) = self.loaded.read() {
            if let Some(grid) = cache.get(name) {
                return Ok(Arc::clone(grid));
            }
        }

        let path = self.grid_path(name);
        if !path.exists() {
            return Err(GridError::NotFound(name.to_string()));
        }
        debug!("Loading grid {name} from {}", path.display());
        let grid = Arc::new(self.read_grid(&path)?);

        if let Ok(mut cache) = self.loaded.write() {
            cache.insert(name.to_string(), Arc::clone(&grid));
        }
        Ok(grid)
    }

    fn available(&self) -> Result<Vec<String>, GridError> {
        let pattern = format!("{}/*.json", self.dir.display());
        let paths = glob::glob(&pattern).map_err(|e| GridError::CouldNotRead {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut names = vec![];
        for entry in paths {
            let path = entry.map_err(|e| GridError::CouldNotRead {
                path: self.dir.clone(),
                reason: e.to_string(),
            })?;
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Grids held in memory, e.g. constructed by the caller or in tests.
#[derive(Debug, Default, Clone)]
pub struct StaticGridStore {
    grids: IndexMap<String, Arc<Grid>>,
}

impl StaticGridStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grid(mut self, grid: Grid) -> Self {
        self.grids.insert(grid.name.clone(), Arc::new(grid));
        self
    }
}

impl GridStore for StaticGridStore {
    fn load(&self, name: &str) -> Result<Arc<Grid>, GridError> {
        self.grids
            .get(name)
            .cloned()
            .ok_or_else(|| GridError::NotFound(name.to_string()))
    }

    fn available(&self) -> Result<Vec<String>, GridError> {
        Ok(self.grids.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, IxDyn};

    fn bare_grid() -> Grid {
        Grid::new(
            "test",
            "latlon",
            arr2(&[[0.0, 1.0], [0.0, 1.0]]).into_dyn(),
            arr2(&[[0.0, 0.0], [1.0, 1.0]]).into_dyn(),
        )
    }

    #[test]
    fn test_unsupported_grid() {
        let grid = bare_grid().with_field("depth", ArrayD::zeros(IxDyn(&[2, 2])));
        assert!(grid.radius_source().is_none());
        match grid.effective_radius().unwrap_err() {
            GridError::Unsupported { grid } => assert_eq!(grid, "test"),
            e => panic!("Expected Unsupported, got {e:?}"),
        }
    }

    #[test]
    fn test_radius_field_priority() {
        let grid = bare_grid()
            .with_field("rA", ArrayD::from_elem(IxDyn(&[2, 2]), 4.0e8))
            .with_field("RAD", ArrayD::from_elem(IxDyn(&[2, 2]), 5.0e3));
        assert_eq!(grid.radius_source(), Some(RadiusSource::Rad));
        let r = grid.effective_radius().unwrap();
        assert_abs_diff_eq!(r[0], 5.0e3);

        let grid = grid.with_field("effective_grid_radius", ArrayD::from_elem(IxDyn(&[2, 2]), 7.0));
        assert_eq!(grid.radius_source(), Some(RadiusSource::EffectiveGridRadius));
    }

    #[test]
    fn test_cell_area_radius() {
        let grid = bare_grid().with_field("rA", ArrayD::from_elem(IxDyn(&[2, 2]), 4.0e8));
        let r = grid.effective_radius().unwrap();
        assert_eq!(r.len(), 4);
        // 0.5 * sqrt(4e8) = 1e4
        assert_abs_diff_eq!(r[3], 1.0e4);
    }

    #[test]
    fn test_validate_radius_length() {
        let grid = bare_grid().with_field("RAD", ArrayD::from_elem(IxDyn(&[3]), 1.0));
        assert!(matches!(grid.validate(), Err(GridError::Inconsistent { .. })));
    }

    #[test]
    fn test_dir_grid_store() {
        let dir = tempfile::tempdir().unwrap();
        let grid = bare_grid().with_field("RAD", ArrayD::from_elem(IxDyn(&[2, 2]), 1.0e5));
        std::fs::write(
            dir.path().join("test.json"),
            serde_json::to_string(&grid).unwrap(),
        )
        .unwrap();

        let store = DirGridStore::new(dir.path());
        assert_eq!(store.available().unwrap(), vec!["test".to_string()]);
        let a = store.load("test").unwrap();
        let b = store.load("test").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second load should reuse the cached grid");
        assert_eq!(a.shape(), &[2, 2]);
        assert!(matches!(store.load("other"), Err(GridError::NotFound(_))));
    }
}
