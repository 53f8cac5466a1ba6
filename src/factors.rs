//! Mapping factors and their two-level (memory + disk) cache.
//!
//! Building factors is by far the most expensive part of a transformation, so
//! they are computed once per (grid, hemisphere, transformation version) and
//! reused by every granule and field that shares that key. On disk each set
//! of factors lives at
//! `{root}/{dataset}/transformed_products/{grid}/{grid}{_hemi}_v{version}_factors.json`.
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use error_stack::{Report, ResultExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TransformationVersion;
use crate::error::TransformError;
use crate::source::Hemisphere;

const FACTORS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Target point {index} has a non-finite coordinate (lon = {lon}, lat = {lat})")]
    InvalidTargetPoint { index: usize, lon: f64, lat: f64 },
    #[error("The source grid has no points")]
    EmptySource,
    #[error("Source field has {actual} values but the mapping factors expect {expected}")]
    SourceSizeMismatch { expected: usize, actual: usize },
    #[error("Target shape {shape:?} holds {size} points but the mapping factors have {expected}")]
    TargetSizeMismatch {
        shape: Vec<usize>,
        size: usize,
        expected: usize,
    },
    #[error("Mapping factors are inconsistent: {0}")]
    Inconsistent(String),
}

/// For every target point, which source points contribute to its value.
///
/// `source_indices[i]` lists the source points within target `i`'s radius,
/// ordered by increasing distance (ties broken by source index); `counts[i]` is
/// its length. `nearest[i]` is the single closest source point regardless of
/// radius, used when there are no radius matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFactors {
    pub source_indices: Vec<Vec<usize>>,
    pub counts: Vec<usize>,
    pub nearest: Vec<usize>,
    pub n_source: usize,
}

impl MappingFactors {
    pub fn n_target(&self) -> usize {
        self.counts.len()
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        let n = self.counts.len();
        if self.source_indices.len() != n || self.nearest.len() != n {
            return Err(MappingError::Inconsistent(format!(
                "{} counts, {} index lists, {} nearest points",
                n,
                self.source_indices.len(),
                self.nearest.len()
            )));
        }

        for (i, (idx, &count)) in self.source_indices.iter().zip(self.counts.iter()).enumerate() {
            if idx.len() != count {
                return Err(MappingError::Inconsistent(format!(
                    "target {i} has count {count} but {} indices",
                    idx.len()
                )));
            }
            if idx.iter().chain(std::iter::once(&self.nearest[i])).any(|&j| j >= self.n_source) {
                return Err(MappingError::Inconsistent(format!(
                    "target {i} refers to a source point beyond {}",
                    self.n_source
                )));
            }
        }
        Ok(())
    }
}

/// Identifies one reusable set of mapping factors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactorsKey {
    pub grid: String,
    pub hemisphere: Option<Hemisphere>,
    pub version: TransformationVersion,
}

impl FactorsKey {
    pub fn new<S: Into<String>>(grid: S, hemisphere: Option<Hemisphere>, version: TransformationVersion) -> Self {
        Self {
            grid: grid.into(),
            hemisphere,
            version,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{self}_factors.json")
    }
}

impl Display for FactorsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.hemisphere {
            Some(h) => write!(f, "{}_{h}_v{}", self.grid, self.version),
            None => write!(f, "{}_v{}", self.grid, self.version),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Could not build mapping factors for {0}")]
    BuildFailed(FactorsKey),
    #[error("Could not save mapping factors to {}", .0.display())]
    CouldNotPersist(PathBuf),
}

#[derive(Serialize, Deserialize)]
struct FactorsBlob {
    format_version: u32,
    key: FactorsKey,
    factors: MappingFactors,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Memory-then-disk cache of [`MappingFactors`], safe to share between jobs.
///
/// Concurrent misses on the same key may build redundantly; whichever copy is
/// written last wins, and since building is deterministic they are identical.
pub struct FactorsCache {
    root: PathBuf,
    dataset: String,
    memory: Mutex<HashMap<FactorsKey, Arc<MappingFactors>>>,
}

impl FactorsCache {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(root: P, dataset: S) -> Self {
        Self {
            root: root.into(),
            dataset: dataset.into(),
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn blob_path(&self, key: &FactorsKey) -> PathBuf {
        self.root
            .join(&self.dataset)
            .join("transformed_products")
            .join(&key.grid)
            .join(key.file_name())
    }

    /// Number of factor sets currently held in memory
    pub fn n_loaded(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Return the factors for `key`, from memory, disk, or by calling `builder`.
    ///
    /// Newly built factors are written to disk before being returned. If the
    /// builder fails, its [`TransformError`] is kept in the report so callers
    /// can tell an unsupported grid from other failures.
    pub fn get_or_build<F>(&self, key: &FactorsKey, builder: F) -> error_stack::Result<Arc<MappingFactors>, CacheError>
    where
        F: FnOnce() -> Result<MappingFactors, TransformError>,
    {
        if let Some(factors) = self.get(key) {
            return Ok(factors);
        }

        info!("Building mapping factors for {key}");
        let factors = builder()
            .map_err(|e| Report::new(e).change_context(CacheError::BuildFailed(key.clone())))?;
        factors
            .validate()
            .map_err(|e| Report::new(TransformError::mapping_failure(e)))
            .change_context_lazy(|| CacheError::BuildFailed(key.clone()))?;

        let path = self.blob_path(key);
        write_blob(&path, key, &factors).change_context_lazy(|| CacheError::CouldNotPersist(path.clone()))?;
        debug!("Saved mapping factors for {key} to {}", path.display());

        let factors = Arc::new(factors);
        if let Ok(mut mem) = self.memory.lock() {
            mem.insert(key.clone(), Arc::clone(&factors));
        }
        Ok(factors)
    }

    /// Look up factors in memory, then on disk. A blob that cannot be read,
    /// or was written for a different key, counts as a miss.
    pub fn get(&self, key: &FactorsKey) -> Option<Arc<MappingFactors>> {
        if let Some(f) = self.memory.lock().ok().and_then(|m| m.get(key).cloned()) {
            return Some(f);
        }

        let path = self.blob_path(key);
        if !path.exists() {
            return None;
        }

        match read_blob(&path, key) {
            Ok(factors) => {
                debug!("Loaded mapping factors for {key} from {}", path.display());
                let factors = Arc::new(factors);
                if let Ok(mut mem) = self.memory.lock() {
                    mem.insert(key.clone(), Arc::clone(&factors));
                }
                Some(factors)
            }
            Err(reason) => {
                warn!("Ignoring mapping factors in {}: {reason}", path.display());
                None
            }
        }
    }
}

fn read_blob(path: &Path, key: &FactorsKey) -> Result<MappingFactors, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let blob: FactorsBlob = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    if blob.format_version != FACTORS_FORMAT_VERSION {
        return Err(format!("unknown format version {}", blob.format_version));
    }
    if &blob.key != key {
        return Err(format!("file holds factors for {}", blob.key));
    }
    blob.factors.validate().map_err(|e| e.to_string())?;
    Ok(blob.factors)
}

/// Write to a temporary file in the same directory then rename, so readers
/// never see a partially written blob.
fn write_blob(path: &Path, key: &FactorsKey, factors: &MappingFactors) -> Result<(), Report<std::io::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let blob = FactorsBlob {
        format_version: FACTORS_FORMAT_VERSION,
        key: key.clone(),
        factors: factors.clone(),
    };
    let text = serde_json::to_string(&blob).map_err(std::io::Error::other)?;

    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.tmp{}-{n}", std::process::id()));
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
