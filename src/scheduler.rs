//! Deciding which (granule, grid, field) transformations still need doing and
//! running them on a worker pool.
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use error_stack::ResultExt;
use indexmap::IndexMap;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::catalog::{Catalog, CatalogError, Document, ProvenanceStore, TransformationProvenance};
use crate::config::{DatasetConfig, FieldInfo};
use crate::error::TransformError;
use crate::factors::{FactorsCache, FactorsKey, MappingFactors};
use crate::grid::{Grid, GridStore};
use crate::hooks::HookRegistry;
use crate::records::RecordStore;
use crate::source::{Hemisphere, SourceReader, SourceRecord};
use crate::spatial_index::SpatialIndexBuilder;
use crate::time_bounds::{rule_for_dataset, TimeBoundsRule};
use crate::transformer::GranuleTransformer;
use crate::utils;

/// Files smaller than this many bytes are treated as failed harvests.
pub const MIN_GRANULE_BYTES: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Could not list the harvested granules")]
    ListGranules,
    #[error("Could not start the worker pool")]
    WorkerPool,
}

/// Overall state of a dataset's transformations, as stored on the dataset document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformationStatus {
    AllSuccessful,
    SomeFailed(usize),
    NoneSuccessful,
    NoneTransformed,
}

impl TransformationStatus {
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (0, 0) => Self::NoneTransformed,
            (0, _) => Self::NoneSuccessful,
            (_, 0) => Self::AllSuccessful,
            (_, n) => Self::SomeFailed(n),
        }
    }
}

impl Display for TransformationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllSuccessful => write!(f, "All transformations successful"),
            Self::SomeFailed(n) => write!(f, "{n} transformations failed"),
            Self::NoneSuccessful => write!(f, "No successful transformations"),
            Self::NoneTransformed => write!(f, "No transformations performed"),
        }
    }
}

/// What happened to one granule in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GranuleOutcome {
    Skipped(String),
    UpToDate,
    Transformed {
        succeeded: usize,
        failed: usize,
        grids_skipped: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleReport {
    pub granule: String,
    pub outcome: GranuleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub granules: usize,
    pub skipped: usize,
    pub up_to_date: usize,
    pub fields_succeeded: usize,
    pub fields_failed: usize,
    pub grids_skipped: usize,
    pub status: Option<TransformationStatus>,
}

impl RunSummary {
    fn add(&mut self, report: &GranuleReport) {
        self.granules += 1;
        match &report.outcome {
            GranuleOutcome::Skipped(_) => self.skipped += 1,
            GranuleOutcome::UpToDate => self.up_to_date += 1,
            GranuleOutcome::Transformed {
                succeeded,
                failed,
                grids_skipped,
            } => {
                self.fields_succeeded += succeeded;
                self.fields_failed += failed;
                self.grids_skipped += grids_skipped;
            }
        }
    }
}

/// Everything a transformation run shares between its workers.
pub struct TransformationScheduler {
    config: Arc<DatasetConfig>,
    catalog: Arc<dyn Catalog>,
    grids: Arc<dyn GridStore>,
    factors: Arc<FactorsCache>,
    reader: Arc<dyn SourceReader>,
    store: Arc<dyn RecordStore>,
    hooks: Arc<HookRegistry>,
    bounds_rule: Arc<dyn TimeBoundsRule>,
    index_builder: SpatialIndexBuilder,
    workers: usize,
}

impl TransformationScheduler {
    pub fn new(
        config: Arc<DatasetConfig>,
        catalog: Arc<dyn Catalog>,
        grids: Arc<dyn GridStore>,
        factors: Arc<FactorsCache>,
        reader: Arc<dyn SourceReader>,
        store: Arc<dyn RecordStore>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let bounds_rule = rule_for_dataset(&config.ds_name, config.time_bounds_override);
        let index_builder = SpatialIndexBuilder::new(config.max_neighbours());
        let workers = config.effective_workers();
        Self {
            config,
            catalog,
            grids,
            factors,
            reader,
            store,
            hooks,
            bounds_rule,
            index_builder,
            workers,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn provenance(&self) -> ProvenanceStore<'_> {
        ProvenanceStore::new(self.catalog.as_ref(), &self.config.ds_name)
    }

    /// The fields of each grid that still need transforming for this granule.
    pub fn remaining_transformations(
        &self,
        granule: &SourceRecord,
        grids: &[String],
    ) -> Result<IndexMap<String, Vec<FieldInfo>>, CatalogError> {
        let existing: HashMap<(String, String), TransformationProvenance> = match &granule.pre_transformation_file_path {
            Some(path) => self
                .provenance()
                .transformations_for_granule(path)?
                .into_iter()
                .map(|p| ((p.grid_name.clone(), p.field.clone()), p))
                .collect(),
            None => HashMap::new(),
        };

        let version = self.config.transformation_version;
        let mut remaining = IndexMap::new();
        for grid in grids {
            let fields: Vec<FieldInfo> = self
                .config
                .fields
                .iter()
                .filter(|f| {
                    !existing
                        .get(&(grid.clone(), f.name.clone()))
                        .map(|p| p.is_current(version, &granule.checksum))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if !fields.is_empty() {
                remaining.insert(grid.clone(), fields);
            }
        }
        Ok(remaining)
    }

    /// The granule's hemisphere tag, or one inferred from its file name.
    pub fn hemisphere_of(&self, granule: &SourceRecord) -> Option<Hemisphere> {
        granule.hemisphere.or_else(|| {
            granule
                .file_name()
                .and_then(|name| self.config.detect_hemisphere(&name))
        })
    }

    /// Load or build the mapping factors for one grid and hemisphere.
    ///
    /// Fails with [`TransformError::UnsupportedGrid`] if the grid has no radius
    /// field, or [`TransformError::CacheBuildFailure`] for anything else; either
    /// way the grid should be skipped for now.
    pub fn factors_for(&self, grid: &Grid, hemisphere: Option<Hemisphere>) -> Result<Arc<MappingFactors>, TransformError> {
        let key = FactorsKey::new(&grid.name, hemisphere, self.config.transformation_version);
        self.factors
            .get_or_build(&key, || {
                let spec = self
                    .config
                    .source_grid_for(hemisphere)
                    .map_err(TransformError::mapping_failure)?;
                let source = spec.build().map_err(TransformError::mapping_failure)?;
                self.index_builder.build(&source, grid)
            })
            .map_err(|report| match report.downcast_ref::<TransformError>() {
                Some(TransformError::UnsupportedGrid { grid }) => TransformError::unsupported_grid(grid.as_str()),
                _ => {
                    error!("{report:?}");
                    TransformError::CacheBuildFailure { key }
                }
            })
    }

    /// Build the factors for every grid and every hemisphere present among
    /// `granules` before the workers start, so they do not all miss at once.
    pub fn pregenerate_factors(&self, grids: &[String], granules: &[SourceRecord]) {
        let hemispheres: BTreeSet<Option<Hemisphere>> = granules.iter().map(|g| self.hemisphere_of(g)).collect();
        for grid_name in grids {
            let grid = match self.grids.load(grid_name) {
                Ok(g) => g,
                Err(e) => {
                    warn!("Not pregenerating factors for {grid_name}: {e}");
                    continue;
                }
            };
            for &hemi in &hemispheres {
                if let Err(err) = self.factors_for(&grid, hemi) {
                    log_grid_skip(grid_name, "all granules", &err);
                }
            }
        }
    }

    /// Transform every harvested granule onto `grids` that is not already up to date.
    pub fn run(&self, grids: &[String], progress: &ProgressBar) -> error_stack::Result<RunSummary, SchedulerError> {
        let granules = self
            .provenance()
            .harvested_granules()
            .change_context(SchedulerError::ListGranules)?;
        info!(
            "{} harvested granules for {}, {} grids, {} workers",
            granules.len(),
            self.config.ds_name,
            grids.len(),
            self.workers
        );

        let mut summary = RunSummary::default();
        if !granules.is_empty() {
            self.pregenerate_factors(grids, &granules);

            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .thread_name(|i| format!("regrid-worker-{i}"))
                .build()
                .change_context(SchedulerError::WorkerPool)?;

            progress.set_length(granules.len() as u64);
            let reports: Vec<GranuleReport> = pool.install(|| {
                granules
                    .par_iter()
                    .progress_with(progress.clone())
                    .map(|g| self.transform_granule(g, grids))
                    .collect()
            });
            progress.finish_and_clear();

            for report in &reports {
                summary.add(report);
            }
        }

        let status = self.update_status();
        summary.status = status;
        Ok(summary)
    }

    /// Recompute the dataset's transformation status from the catalog and
    /// store it on the dataset document. Catalog failures are logged.
    fn update_status(&self) -> Option<TransformationStatus> {
        let store = self.provenance();
        let counts = store
            .count_transformations(true)
            .and_then(|s| Ok((s, store.count_transformations(false)?)));
        let status = match counts {
            Ok((s, f)) => TransformationStatus::from_counts(s, f),
            Err(e) => {
                error!("Could not count transformations for {}: {e}", self.config.ds_name);
                return None;
            }
        };

        let mut fields = Document::new();
        fields.insert("transformation_status".into(), status.to_string().into());
        if let Err(e) = store.update_dataset(fields) {
            error!("Could not update the status of {}: {e}", self.config.ds_name);
        }
        Some(status)
    }

    /// Transform one granule. Never fails: problems are logged and reported
    /// in the outcome.
    pub fn transform_granule(&self, granule: &SourceRecord, grids: &[String]) -> GranuleReport {
        let name = granule
            .file_name()
            .unwrap_or_else(|| granule.date.clone());
        let report = |outcome| GranuleReport {
            granule: name.clone(),
            outcome,
        };

        let Some(path) = granule.pre_transformation_file_path.as_deref() else {
            warn!("Granule {name} has no local file; skipping");
            return report(GranuleOutcome::Skipped("no local file".into()));
        };
        if let Err(reason) = check_granule_file(path) {
            error!("Granule {name} was not harvested properly ({reason}); skipping");
            return report(GranuleOutcome::Skipped(reason));
        }

        let remaining = match self.remaining_transformations(granule, grids) {
            Ok(r) => r,
            Err(e) => {
                error!("Could not look up previous transformations of {name}: {e}");
                return report(GranuleOutcome::Skipped(e.to_string()));
            }
        };
        if remaining.is_empty() {
            debug!("{name} is up to date");
            return report(GranuleOutcome::UpToDate);
        }

        let source = match self.reader.open(path) {
            Ok(s) => s,
            Err(e) => {
                error!("{e}");
                return report(GranuleOutcome::Skipped(e.to_string()));
            }
        };

        let hemisphere = self.hemisphere_of(granule);
        let stem = output_stem(path);
        let (mut succeeded, mut failed, mut grids_skipped) = (0, 0, 0);
        let mut descendants = Document::new();

        for (grid_name, fields) in &remaining {
            let grid = match self.grids.load(grid_name) {
                Ok(g) => g,
                Err(e) => {
                    warn!("Skipping grid {grid_name} for {name}: {e}");
                    grids_skipped += 1;
                    continue;
                }
            };
            let factors = match self.factors_for(&grid, hemisphere) {
                Ok(f) => f,
                Err(err) => {
                    log_grid_skip(grid_name, &name, &err);
                    grids_skipped += 1;
                    continue;
                }
            };

            for field in fields {
                self.record(self.provenance_for(granule, path, &grid.name, field, hemisphere, None));
            }

            let transformer =
                GranuleTransformer::new(&self.config, &grid, &factors, &self.hooks, self.bounds_rule.as_ref());
            let results = match transformer.transform(granule, &source, fields) {
                Ok(r) => r,
                Err(e) => {
                    error!("Could not transform {name} onto {grid_name}: {e}");
                    failed += fields.len();
                    for field in fields {
                        self.record(self.provenance_for(granule, path, &grid.name, field, hemisphere, Some(false)));
                    }
                    continue;
                }
            };

            for (field, ft) in fields.iter().zip(results) {
                let mut prov = self.provenance_for(granule, path, &grid.name, field, hemisphere, Some(ft.success));
                match self.store.write(&ft.record, &stem) {
                    Ok(out) => {
                        prov.transformation_checksum = utils::file_sha256(&out)
                            .map_err(|e| warn!("Could not checksum {}: {e}", out.display()))
                            .ok();
                        descendants.insert(
                            format!("{}_{}_transformation_file_path", grid.name, field.name),
                            out.to_string_lossy().to_string().into(),
                        );
                        prov.transformation_file_path = Some(out);
                    }
                    Err(e) => {
                        error!("{e}");
                        prov.success = false;
                    }
                }

                if prov.success {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
                self.record(prov);
            }
        }

        if succeeded + failed > 0 {
            descendants.insert("all_transformations_success".into(), (failed == 0).into());
            if let Err(e) = self
                .provenance()
                .update_descendants(&granule.date, hemisphere, descendants)
            {
                error!("Could not update the descendants of {name}: {e}");
            }
        }

        report(GranuleOutcome::Transformed {
            succeeded,
            failed,
            grids_skipped,
        })
    }

    /// Provenance for a transformation attempt. `success: None` marks it in progress.
    fn provenance_for(
        &self,
        granule: &SourceRecord,
        path: &Path,
        grid: &str,
        field: &FieldInfo,
        hemisphere: Option<Hemisphere>,
        success: Option<bool>,
    ) -> TransformationProvenance {
        TransformationProvenance {
            id: None,
            dataset: self.config.ds_name.clone(),
            grid_name: grid.to_string(),
            field: field.name.clone(),
            pre_transformation_file_path: path.to_path_buf(),
            date: granule.date.clone(),
            hemisphere,
            origin_checksum: granule.checksum.clone(),
            transformation_version: Some(self.config.transformation_version),
            success: success.unwrap_or(false),
            transformation_in_progress: success.is_none(),
            transformation_file_path: None,
            transformation_checksum: None,
            transformation_completed: success.map(|_| Utc::now()),
        }
    }

    fn record(&self, prov: TransformationProvenance) {
        if let Err(e) = self.provenance().record_transformation(&prov) {
            let err = TransformError::Catalog(e.to_string());
            error!(
                "Provenance of {} on {} for {} not recorded. {err}",
                prov.field,
                prov.grid_name,
                prov.pre_transformation_file_path.display()
            );
        }
    }
}

fn check_granule_file(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("cannot stat {}: {e}", path.display()))?;
    if meta.len() < MIN_GRANULE_BYTES {
        return Err(format!("{} is only {} bytes", path.display(), meta.len()));
    }
    Ok(())
}

/// File stem used in transformed file names; compressed sources are named
/// after the file they decompress to.
fn output_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = name.strip_suffix(".bz2").unwrap_or(&name);
    utils::file_stem_string(Path::new(name))
}

fn log_grid_skip(grid_name: &str, granule: &str, err: &TransformError) {
    match err {
        TransformError::UnsupportedGrid { .. } => warn!("Skipping grid {grid_name} for {granule}: {err}"),
        _ => error!("Skipping grid {grid_name} for {granule}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Filter, InMemoryCatalog};
    use crate::grid::StaticGridStore;
    use crate::records::JsonRecordStore;
    use crate::source::{JsonSourceReader, SourceDataset};
    use crate::assembler::{CatalogRecordSource, DateSeriesAssembler};
    use crate::config::TransformationVersion;
    use crate::records::is_missing_value;
    use crate::test_utils::{daily_config, granule_doc, hemisphere_config, latlon_grid};
    use crate::time_bounds::CalendarWindow;
    use chrono::NaiveDate;
    use ndarray::Array1;

    struct Setup {
        _dir: tempfile::TempDir,
        catalog: Arc<InMemoryCatalog>,
        factors: Arc<FactorsCache>,
        scheduler: TransformationScheduler,
    }

    fn write_granule(dir: &Path, name: &str, values: Vec<f64>) -> String {
        let ds = SourceDataset::default().with_variable("sst", Array1::from(values).into_dyn());
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(&ds).unwrap()).unwrap();
        path.to_string_lossy().to_string()
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let gran_dir = dir.path().join("harvested");
        std::fs::create_dir_all(&gran_dir).unwrap();

        // 24 source points on the 12 x 2 test source grid
        let p1 = write_granule(&gran_dir, "sst_20100101.json", (0..24).map(|i| i as f64).collect());
        let p2 = write_granule(&gran_dir, "sst_20100102.json", (0..24).map(|i| 2.0 * i as f64).collect());
        let tiny = gran_dir.join("sst_20100103.json");
        std::fs::write(&tiny, "{}").unwrap();

        let catalog = Arc::new(InMemoryCatalog::with_documents(vec![
            granule_doc("TEST_DAILY", &p1, "2010-01-01T00:00:00Z", "c1"),
            granule_doc("TEST_DAILY", &p2, "2010-01-02T00:00:00Z", "c2"),
            granule_doc("TEST_DAILY", &tiny.to_string_lossy(), "2010-01-03T00:00:00Z", "c3"),
        ]));

        let grids = StaticGridStore::new()
            .with_grid(latlon_grid("g", &[0.5, 5.5, 9.5], &[-0.5, 0.5], 120e3))
            .with_grid(crate::grid::Grid::new(
                "unsupported",
                "latlon",
                ndarray::arr2(&[[0.0]]).into_dyn(),
                ndarray::arr2(&[[0.0]]).into_dyn(),
            ));

        build(dir, daily_config(), catalog, grids)
    }

    fn build(dir: tempfile::TempDir, config: DatasetConfig, catalog: Arc<InMemoryCatalog>, grids: StaticGridStore) -> Setup {
        let out = dir.path().join("output");
        let factors = Arc::new(FactorsCache::new(&out, config.ds_name.clone()));
        let scheduler = TransformationScheduler::new(
            Arc::new(config),
            catalog.clone(),
            Arc::new(grids),
            factors.clone(),
            Arc::new(JsonSourceReader),
            Arc::new(JsonRecordStore::new(&out)),
            Arc::new(HookRegistry::with_builtins()),
        )
        .with_workers(2);

        Setup {
            _dir: dir,
            catalog,
            factors,
            scheduler,
        }
    }

    /// One north and one south file for 2010-01-01, holding 1.0 and 2.0 everywhere.
    fn hemisphere_setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let gran_dir = dir.path().join("harvested");
        std::fs::create_dir_all(&gran_dir).unwrap();
        let nh = write_granule(&gran_dir, "sst_nh_20100101.json", vec![1.0; 12]);
        let sh = write_granule(&gran_dir, "sst_sh_20100101.json", vec![2.0; 12]);
        let catalog = Arc::new(InMemoryCatalog::with_documents(vec![
            granule_doc("TEST_HEMI", &nh, "2010-01-01T00:00:00Z", "n1"),
            granule_doc("TEST_HEMI", &sh, "2010-01-01T00:00:00Z", "s1"),
        ]));
        let grids = StaticGridStore::new().with_grid(latlon_grid("g", &[0.5, 5.5, 9.5], &[-0.5, 0.5], 120e3));
        build(dir, hemisphere_config(), catalog, grids)
    }

    fn grids() -> Vec<String> {
        vec!["g".to_string(), "unsupported".to_string()]
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TransformationStatus::from_counts(3, 0).to_string(), "All transformations successful");
        assert_eq!(TransformationStatus::from_counts(3, 2).to_string(), "2 transformations failed");
        assert_eq!(TransformationStatus::from_counts(0, 2).to_string(), "No successful transformations");
        assert_eq!(TransformationStatus::from_counts(0, 0).to_string(), "No transformations performed");
    }

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem(Path::new("/a/b/x_20100101.nc.bz2")), "x_20100101");
        assert_eq!(output_stem(Path::new("/a/b/x_20100101.nc")), "x_20100101");
    }

    #[test]
    fn test_run_then_rerun_is_idempotent() {
        let s = setup();
        let summary = s.scheduler.run(&grids(), &ProgressBar::hidden()).unwrap();
        assert_eq!(summary.granules, 3);
        assert_eq!(summary.skipped, 1, "the undersized granule should be skipped");
        assert_eq!(summary.fields_succeeded, 2);
        assert_eq!(summary.fields_failed, 0);
        assert_eq!(summary.grids_skipped, 2, "the unsupported grid is skipped for each granule");
        assert_eq!(summary.status, Some(TransformationStatus::AllSuccessful));

        let provs = s
            .catalog
            .query(&[Filter::eq("type", "transformation"), Filter::eq("grid_name", "g")])
            .unwrap();
        assert_eq!(provs.len(), 2);
        for doc in provs {
            let p = TransformationProvenance::from_document(doc).unwrap();
            assert!(p.success);
            assert!(!p.transformation_in_progress);
            assert!(p.transformation_checksum.is_some());
            assert!(p.transformation_file_path.unwrap().exists());
        }

        let again = s.scheduler.run(&grids(), &ProgressBar::hidden()).unwrap();
        // The unsupported grid never gets provenance, so those granules are
        // revisited but only to skip that grid again.
        assert_eq!(again.fields_succeeded, 0);
        assert_eq!(again.fields_failed, 0);
    }

    #[test]
    fn test_remaining_respects_version_and_checksum() {
        let s = setup();
        s.scheduler.run(&grids(), &ProgressBar::hidden()).unwrap();
        let granules = s.scheduler.provenance().harvested_granules().unwrap();
        let g1 = granules.iter().find(|g| g.checksum == "c1").unwrap().clone();

        let only_g = vec!["g".to_string()];
        assert!(s.scheduler.remaining_transformations(&g1, &only_g).unwrap().is_empty());

        let mut changed = g1.clone();
        changed.checksum = "new".into();
        let remaining = s.scheduler.remaining_transformations(&changed, &only_g).unwrap();
        assert_eq!(remaining["g"].len(), 1);
    }

    #[test]
    fn test_hemisphere_granules_on_one_date() {
        let s = hemisphere_setup();
        let summary = s.scheduler.run(&["g".to_string()], &ProgressBar::hidden()).unwrap();
        assert_eq!(summary.granules, 2);
        assert_eq!(summary.fields_succeeded, 2);
        assert_eq!(summary.status, Some(TransformationStatus::AllSuccessful));

        let version = TransformationVersion(1.0);
        let north_key = FactorsKey::new("g", Some(Hemisphere::North), version);
        let south_key = FactorsKey::new("g", Some(Hemisphere::South), version);
        assert_eq!(s.factors.n_loaded(), 2);
        assert!(s.factors.get(&north_key).is_some());
        assert!(s.factors.get(&south_key).is_some());
        assert_ne!(s.factors.blob_path(&north_key), s.factors.blob_path(&south_key));
        assert!(s.factors.blob_path(&north_key).exists());
        assert!(s.factors.blob_path(&south_key).exists());

        let mut hemispheres: Vec<_> = s
            .catalog
            .query(&[Filter::eq("type", "transformation"), Filter::eq("grid_name", "g")])
            .unwrap()
            .into_iter()
            .map(|d| TransformationProvenance::from_document(d).unwrap().hemisphere)
            .collect();
        hemispheres.sort();
        assert_eq!(hemispheres, vec![Some(Hemisphere::North), Some(Hemisphere::South)]);

        let descendants = s.scheduler.provenance().descendants("2010-01-01").unwrap();
        assert_eq!(descendants.len(), 2);
        for d in &descendants {
            assert_eq!(d["all_transformations_success"], true);
            assert!(d.contains_key("g_sst_transformation_file_path"));
        }

        let config = hemisphere_config();
        let grid = latlon_grid("g", &[0.5, 5.5, 9.5], &[-0.5, 0.5], 120e3);
        let store = JsonRecordStore::new("/");
        let source = CatalogRecordSource::new(ProvenanceStore::new(s.catalog.as_ref(), "TEST_HEMI"), &store);
        let series = DateSeriesAssembler::new(&source, &config, &grid, &CalendarWindow)
            .assemble(&config.fields[0], 2010)
            .unwrap();

        let jan1 = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap();
        let used: Vec<_> = series.sources.iter().filter(|l| l.date == jan1).collect();
        assert_eq!(used.len(), 2);

        // North is primary: its valid cells win, the south file only fills gaps
        let north_path = &used.iter().find(|l| l.hemisphere == Some(Hemisphere::North)).unwrap().path;
        let north = store.read(north_path).unwrap();
        assert!(!north.is_all_missing());
        let merged = &series.records[series.dates.iter().position(|d| *d == jan1).unwrap()];
        assert_eq!(merged.hemisphere, None);
        for (m, n) in merged.values.iter().zip(north.values.iter()) {
            if is_missing_value(*n, north.fill_value) {
                assert!(is_missing_value(*m, merged.fill_value) || *m == 2.0);
            } else {
                assert_eq!(*m, *n);
                assert_eq!(*m, 1.0);
            }
        }
    }

    #[test]
    fn test_transformed_values() {
        let s = setup();
        s.scheduler.run(&["g".to_string()], &ProgressBar::hidden()).unwrap();
        let docs = s
            .catalog
            .query(&[Filter::eq("type", "transformation"), Filter::prefix("date", "2010-01-01")])
            .unwrap();
        let p = TransformationProvenance::from_document(docs[0].clone()).unwrap();
        let rec = JsonRecordStore::new("/").read(&p.transformation_file_path.unwrap()).unwrap();
        assert_eq!(rec.values.shape(), &[1, 2, 3]);
        assert!(!rec.is_all_missing());
        assert!(rec.attrs.valid_min.unwrap() >= 0.0);
        assert!(rec.attrs.valid_max.unwrap() <= 23.0);
    }
}
