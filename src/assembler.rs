//! Assembling a gap-free annual series of transformed records for one
//! (dataset, grid, field, year).
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use log::{debug, info, warn};
use ndarray::{ArrayD, Axis, Zip};

use crate::catalog::{CatalogError, ProvenanceStore};
use crate::config::{DatasetConfig, FieldInfo};
use crate::error::{DateTimeError, RecordIoError};
use crate::grid::Grid;
use crate::records::{is_missing_value, EmptyRecordFactory, RecordStore, TransformedRecord};
use crate::source::Hemisphere;
use crate::time_bounds::{dates_in_year, TimeBoundsRule, TimeScale};

/// Where a transformed record for a given date can be loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLocator {
    pub path: PathBuf,
    pub date: NaiveDate,
    pub hemisphere: Option<Hemisphere>,
}

/// Finds and loads previously transformed records.
pub trait TransformedRecordSource {
    /// Successfully transformed records of `field` on `grid` dated `date`.
    fn find(&self, grid: &str, field: &str, date: NaiveDate) -> Result<Vec<RecordLocator>, CatalogError>;

    fn load(&self, locator: &RecordLocator) -> Result<TransformedRecord, RecordIoError>;
}

/// Finds records through transformation provenance in the catalog.
pub struct CatalogRecordSource<'a> {
    provenance: ProvenanceStore<'a>,
    store: &'a dyn RecordStore,
}

impl<'a> CatalogRecordSource<'a> {
    pub fn new(provenance: ProvenanceStore<'a>, store: &'a dyn RecordStore) -> Self {
        Self { provenance, store }
    }
}

impl TransformedRecordSource for CatalogRecordSource<'_> {
    fn find(&self, grid: &str, field: &str, date: NaiveDate) -> Result<Vec<RecordLocator>, CatalogError> {
        let prefix = date.format("%Y-%m-%d").to_string();
        let found = self
            .provenance
            .successful_transformations(grid, field, &prefix)?
            .into_iter()
            .filter_map(|p| {
                p.transformation_file_path.map(|path| RecordLocator {
                    path,
                    date,
                    hemisphere: p.hemisphere,
                })
            })
            .collect();
        Ok(found)
    }

    fn load(&self, locator: &RecordLocator) -> Result<TransformedRecord, RecordIoError> {
        self.store.read(&locator.path)
    }
}

/// Offsets in days to try around a monthly date: +1, -1, +2, -2, ... up to
/// `tolerance` in each direction.
pub fn tolerance_offsets(tolerance: u32) -> impl Iterator<Item = i64> {
    (1..=tolerance as i64).flat_map(|i| [i, -i])
}

/// Merge hemisphere records for the same date into one.
///
/// The first record (primary hemisphere first) that is not entirely missing
/// is the base; each of its missing cells is filled from the first other
/// record with a value at that cell. Records whose shape differs from the
/// base are ignored. Returns `None` only if `records` is empty.
pub fn merge_hemispheres(mut records: Vec<TransformedRecord>, primary: Hemisphere) -> Option<TransformedRecord> {
    // Primary hemisphere first, then the other one, then untagged records
    records.sort_by_key(|r| match r.hemisphere {
        Some(h) if h == primary => 0,
        Some(_) => 1,
        None => 2,
    });

    let base_idx = records.iter().position(|r| !r.is_all_missing()).unwrap_or(0);
    if records.is_empty() {
        return None;
    }
    let mut base = records.remove(base_idx);
    if records.is_empty() {
        return Some(base);
    }

    let base_fill = base.fill_value;
    for other in &records {
        if other.values.shape() != base.values.shape() {
            warn!(
                "Not merging {} record with shape {:?} into one with shape {:?}",
                other.var_name,
                other.values.shape(),
                base.values.shape()
            );
            continue;
        }
        let other_fill = other.fill_value;
        Zip::from(&mut base.values).and(&other.values).for_each(|b, &o| {
            if is_missing_value(*b, base_fill) && !is_missing_value(o, other_fill) {
                *b = o;
            }
        });
    }

    base.hemisphere = None;
    base.update_valid_range();
    Some(base)
}

/// One year of records at a dataset's time scale, in date order.
#[derive(Debug, Clone)]
pub struct AnnualSeries {
    pub dataset: String,
    pub grid_name: String,
    pub field_name: String,
    pub year: i32,
    pub time_scale: TimeScale,
    pub dates: Vec<NaiveDate>,
    pub records: Vec<TransformedRecord>,
    /// Where the non-empty records were loaded from, in date order
    pub sources: Vec<RecordLocator>,
}

impl AnnualSeries {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True if every record in the series is entirely missing
    pub fn is_empty_year(&self) -> bool {
        self.records.iter().all(|r| r.is_all_missing())
    }

    /// All records' values (missing as NaN) stacked along the time axis.
    pub fn stacked_values(&self) -> Result<ArrayD<f64>, ndarray::ShapeError> {
        let values: Vec<ArrayD<f64>> = self.records.iter().map(|r| r.values_with_nan()).collect();
        let views: Vec<_> = values.iter().map(|v| v.view()).collect();
        ndarray::concatenate(Axis(0), &views)
    }

    pub fn times(&self) -> Vec<NaiveDateTime> {
        self.records.iter().map(|r| r.time).collect()
    }

    pub fn time_bounds(&self) -> Vec<[NaiveDateTime; 2]> {
        self.records.iter().map(|r| r.time_bounds).collect()
    }
}

/// Walks every date of a year and produces exactly one record per date.
pub struct DateSeriesAssembler<'a, S: TransformedRecordSource> {
    source: &'a S,
    config: &'a DatasetConfig,
    grid: &'a Grid,
    bounds_rule: &'a dyn TimeBoundsRule,
}

impl<'a, S: TransformedRecordSource> DateSeriesAssembler<'a, S> {
    pub fn new(source: &'a S, config: &'a DatasetConfig, grid: &'a Grid, bounds_rule: &'a dyn TimeBoundsRule) -> Self {
        Self {
            source,
            config,
            grid,
            bounds_rule,
        }
    }

    pub fn assemble(&self, field: &FieldInfo, year: i32) -> Result<AnnualSeries, DateTimeError> {
        let dates = dates_in_year(year, self.config.data_time_scale)?;
        info!(
            "Assembling {} records of {} on {} for {year}",
            dates.len(),
            field.name,
            self.grid.name
        );

        let mut records = Vec::with_capacity(dates.len());
        let mut sources = vec![];
        for &date in &dates {
            let (record, used) = self.record_for_date(field, date)?;
            records.push(record);
            sources.extend(used);
        }

        Ok(AnnualSeries {
            dataset: self.config.ds_name.clone(),
            grid_name: self.grid.name.clone(),
            field_name: field.name.clone(),
            year,
            time_scale: self.config.data_time_scale,
            dates,
            records,
            sources,
        })
    }

    /// Locate records for `date`, falling back to nearby dates for monthly data.
    pub fn find_records(&self, field: &FieldInfo, date: NaiveDate) -> Result<Vec<RecordLocator>, CatalogError> {
        let found = self.source.find(&self.grid.name, &field.name, date)?;
        if !found.is_empty() || self.config.data_time_scale != TimeScale::Monthly {
            return Ok(found);
        }

        for offset in tolerance_offsets(self.config.monthly_tolerance) {
            let Some(candidate) = date.checked_add_signed(TimeDelta::days(offset)) else {
                continue;
            };
            let found = self.source.find(&self.grid.name, &field.name, candidate)?;
            if !found.is_empty() {
                debug!("Using {candidate} for {date} ({} records)", found.len());
                return Ok(found);
            }
        }
        Ok(vec![])
    }

    /// The record for `date` and the locators of the records merged into it
    /// (none if the record is empty).
    fn record_for_date(
        &self,
        field: &FieldInfo,
        date: NaiveDate,
    ) -> Result<(TransformedRecord, Vec<RecordLocator>), DateTimeError> {
        let factory = EmptyRecordFactory::new(self.config, self.grid, self.bounds_rule);
        let empty = || -> Result<(TransformedRecord, Vec<RecordLocator>), DateTimeError> {
            Ok((factory.empty_record(field, date, None, None, "")?, vec![]))
        };

        let locators = match self.find_records(field, date) {
            Ok(l) => l,
            Err(e) => {
                warn!("Could not look up {} records for {date}: {e}", field.name);
                return empty();
            }
        };
        if locators.is_empty() {
            return empty();
        }

        let expected: Vec<usize> = std::iter::once(1).chain(self.grid.shape().iter().copied()).collect();
        let mut loaded = vec![];
        for loc in &locators {
            match self.source.load(loc) {
                Ok(rec) if rec.values.shape() == expected.as_slice() => loaded.push(rec),
                Ok(rec) => warn!(
                    "{}",
                    RecordIoError::WrongShape {
                        path: loc.path.clone(),
                        expected: expected.clone(),
                        actual: rec.values.shape().to_vec(),
                    }
                ),
                Err(e) => warn!("{e}"),
            }
        }

        // If any matched record could not be used, the date is treated as
        // having no data rather than merging an incomplete set.
        if loaded.len() != locators.len() {
            return empty();
        }

        match merge_hemispheres(loaded, self.config.primary_hemisphere()) {
            Some(rec) => Ok((rec, locators)),
            None => empty(),
        }
    }
}
