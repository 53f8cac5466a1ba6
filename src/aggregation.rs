//! Turning an [`AnnualSeries`] into the arrays and attributes written by the
//! aggregation stage. Only the interface of that stage is modeled here:
//! concatenation, the monthly roll-up of daily data, valid range and time
//! coverage attributes, and deciding which years need (re)aggregating.
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime};
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assembler::AnnualSeries;
use crate::catalog::{AggregationProvenance, CatalogError, Document, ProvenanceStore, TransformationProvenance};
use crate::error::{DateTimeError, RecordIoError};
use crate::mapper::ReductionOp;
use crate::records::ArrayPrecision;
use crate::source::{Hemisphere, SourceRecord};
use crate::time_bounds::{CalendarWindow, TimeBoundsRule, TimeScale};
use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("Records in the {year} series of {field} could not be stacked: {reason}")]
    Shape { field: String, year: i32, reason: String },
    #[error("The {year} series of {field} has no records")]
    NoRecords { field: String, year: i32 },
    #[error(transparent)]
    DateTime(#[from] DateTimeError),
}

/// One year of one field, ready to save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualAggregate {
    pub var_name: String,
    pub dataset: String,
    pub grid_name: String,
    pub field_name: String,
    pub year: i32,
    pub time_scale: TimeScale,
    /// `[n_times, grid dims...]`, missing values as NaN
    pub values: ArrayD<f64>,
    pub times: Vec<NaiveDateTime>,
    pub time_bounds: Vec<[NaiveDateTime; 2]>,
    pub valid_min: Option<f64>,
    pub valid_max: Option<f64>,
    pub precision: ArrayPrecision,
    /// Identifies this product; also stored in `attrs["uuid"]`
    pub uuid: Uuid,
    pub attrs: IndexMap<String, Value>,
}

impl AnnualAggregate {
    pub fn from_series(series: &AnnualSeries) -> Result<Self, AggregationError> {
        let first = series.records.first().ok_or_else(|| AggregationError::NoRecords {
            field: series.field_name.clone(),
            year: series.year,
        })?;

        let values = series.stacked_values().map_err(|e| AggregationError::Shape {
            field: series.field_name.clone(),
            year: series.year,
            reason: e.to_string(),
        })?;

        let mut attrs = first.global_attrs.clone();
        attrs.insert("long_name".into(), first.attrs.long_name.clone().into());
        attrs.insert("standard_name".into(), first.attrs.standard_name.clone().into());
        attrs.insert("units".into(), first.attrs.units.clone().into());

        let mut agg = Self {
            var_name: first.var_name.clone(),
            dataset: series.dataset.clone(),
            grid_name: series.grid_name.clone(),
            field_name: series.field_name.clone(),
            year: series.year,
            time_scale: series.time_scale,
            values,
            times: series.times(),
            time_bounds: series.time_bounds(),
            valid_min: None,
            valid_max: None,
            precision: first.precision,
            uuid: Uuid::new_v4(),
            attrs,
        };
        agg.finish_attributes();
        Ok(agg)
    }

    /// True if there is no valid value anywhere in the year
    pub fn is_empty_year(&self) -> bool {
        self.values.iter().all(|v| !v.is_finite())
    }

    /// The values with missing cells replaced by `fill`, e.g. for binary output
    pub fn filled_values(&self, fill: f64) -> ArrayD<f64> {
        self.values.mapv(|v| if v.is_finite() { v } else { fill })
    }

    /// Average daily data into calendar months. Months with no valid value at
    /// a cell are missing there.
    pub fn monthly_roll_up(&self) -> Result<Self, AggregationError> {
        let mut values = vec![];
        let mut times = vec![];
        let mut bounds = vec![];

        let groups = self.time_bounds.iter().enumerate().chunk_by(|(_, b)| b[0].month());
        for (month, chunk) in &groups {
            let idx: Vec<usize> = chunk.map(|(i, _)| i).collect();
            let month_slab = self.values.select(Axis(0), &idx);
            let mean = month_slab.map_axis(Axis(0), |cell| ReductionOp::Mean.reduce(&cell.to_vec()));
            values.push(mean.insert_axis(Axis(0)));

            let first_day = utils::ymd(self.year, month, 1)?;
            let window = CalendarWindow.window(first_day, None, TimeScale::Monthly)?;
            times.push(window.center());
            bounds.push(window.as_array());
        }

        let views: Vec<_> = values.iter().map(|v| v.view()).collect();
        let values = ndarray::concatenate(Axis(0), &views).map_err(|e| AggregationError::Shape {
            field: self.field_name.clone(),
            year: self.year,
            reason: e.to_string(),
        })?;

        let mut agg = Self {
            values,
            times,
            time_bounds: bounds,
            time_scale: TimeScale::Monthly,
            uuid: Uuid::new_v4(),
            ..self.clone()
        };
        agg.finish_attributes();
        Ok(agg)
    }

    fn finish_attributes(&mut self) {
        let (lo, hi) = self
            .values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold((None, None), |(lo, hi): (Option<f64>, Option<f64>), v| {
                (Some(lo.map_or(v, |l| l.min(v))), Some(hi.map_or(v, |h| h.max(v))))
            });
        self.valid_min = lo;
        self.valid_max = hi;

        if let (Some(start), Some(end)) = (self.time_bounds.first(), self.time_bounds.last()) {
            self.attrs.insert(
                "time_coverage_start".into(),
                start[0].format("%Y-%m-%dT%H:%M:%S").to_string().into(),
            );
            self.attrs.insert(
                "time_coverage_end".into(),
                end[1].format("%Y-%m-%dT%H:%M:%S").to_string().into(),
            );
        }
        self.attrs.insert("time_coverage_duration".into(), "P1Y".into());
        self.attrs.insert(
            "time_coverage_resolution".into(),
            self.time_scale.coverage_resolution().into(),
        );
        self.attrs.insert("uuid".into(), self.uuid.to_string().into());
        self.attrs
            .insert("valid_min".into(), self.valid_min.map(Value::from).unwrap_or(Value::Null));
        self.attrs
            .insert("valid_max".into(), self.valid_max.map(Value::from).unwrap_or(Value::Null));
    }

    /// Output file name stem, e.g. `sst_g_DAILY_2010`
    pub fn file_stem(&self) -> String {
        let scale = match self.time_scale {
            TimeScale::Daily => "DAILY",
            TimeScale::Monthly => "MONTHLY",
        };
        format!("{}_{}_{scale}_{}", self.field_name, self.grid_name, self.year)
    }
}

/// A transformation whose record went into an aggregate, with the granule
/// documents of the file it was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationLineage {
    #[serde(flatten)]
    pub transformation: TransformationProvenance,
    pub harvested: Vec<SourceRecord>,
}

/// Everything one (grid, field, year) aggregation descends from: the dataset
/// document, the aggregation's own provenance, and the transformations whose
/// records make up the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescendantsReport {
    pub dataset: Option<Document>,
    pub aggregation: Vec<AggregationProvenance>,
    pub transformations: Vec<TransformationLineage>,
}

impl DescendantsReport {
    /// Gather the lineage of `series` from the catalog. Only transformations
    /// whose record files were actually loaded into the series are listed.
    pub fn collect(provenance: &ProvenanceStore, series: &AnnualSeries) -> Result<Self, CatalogError> {
        let used: HashSet<&Path> = series.sources.iter().map(|l| l.path.as_path()).collect();

        let mut transformations = vec![];
        for t in provenance.transformations_for_grid(&series.grid_name, Some(true))? {
            let is_used = t.field == series.field_name
                && t.transformation_file_path
                    .as_deref()
                    .map(|p| used.contains(p))
                    .unwrap_or(false);
            if !is_used {
                continue;
            }
            let harvested = provenance.granules_for_path(&t.pre_transformation_file_path)?;
            transformations.push(TransformationLineage {
                transformation: t,
                harvested,
            });
        }
        transformations.sort_by(|a, b| {
            (&a.transformation.date, a.transformation.hemisphere)
                .cmp(&(&b.transformation.date, b.transformation.hemisphere))
        });

        let aggregation = provenance
            .aggregations(&series.grid_name, series.year)?
            .into_iter()
            .filter(|a| a.field == series.field_name)
            .collect();

        Ok(Self {
            dataset: provenance.dataset_document()?,
            aggregation,
            transformations,
        })
    }
}

/// Where aggregated years are written.
pub trait AggregationSink {
    fn save(&self, aggregate: &AnnualAggregate) -> Result<PathBuf, RecordIoError>;

    /// Export the lineage of the `series` aggregation next to its products.
    fn save_descendants(&self, series: &AnnualSeries, report: &DescendantsReport) -> Result<PathBuf, RecordIoError>;
}

/// Writes aggregates as JSON under `{root}/{dataset}/transformed_products/{grid}/aggregated/{field}/`.
pub struct JsonAggregationSink {
    root: PathBuf,
}

impl JsonAggregationSink {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn output_dir(&self, dataset: &str, grid: &str, field: &str) -> Result<PathBuf, RecordIoError> {
        let dir = self
            .root
            .join(dataset)
            .join("transformed_products")
            .join(grid)
            .join("aggregated")
            .join(field);
        std::fs::create_dir_all(&dir).map_err(|e| RecordIoError::could_not_write(&dir, e))?;
        Ok(dir)
    }
}

impl AggregationSink for JsonAggregationSink {
    fn save(&self, aggregate: &AnnualAggregate) -> Result<PathBuf, RecordIoError> {
        let dir = self.output_dir(&aggregate.dataset, &aggregate.grid_name, &aggregate.field_name)?;

        // NaN has no JSON representation, so missing values are written as the binary fill
        let mut out = aggregate.clone();
        out.values = aggregate.filled_values(aggregate.precision.binary_fill());
        let path = dir.join(format!("{}.json", aggregate.file_stem()));
        let text = serde_json::to_string(&out).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        std::fs::write(&path, text).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        Ok(path)
    }

    fn save_descendants(&self, series: &AnnualSeries, report: &DescendantsReport) -> Result<PathBuf, RecordIoError> {
        let dir = self.output_dir(&series.dataset, &series.grid_name, &series.field_name)?;
        let path = dir.join(format!(
            "{}_{}_{}_{}_descendants.json",
            series.dataset, series.field_name, series.grid_name, series.year
        ));
        let text = serde_json::to_string_pretty(report).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        std::fs::write(&path, text).map_err(|e| RecordIoError::could_not_write(&path, e))?;
        Ok(path)
    }
}

/// Mark the descendants documents of every granule date in `year` with the
/// outcome of one (grid, field) aggregation and the paths of its products.
/// Only existing documents are updated.
pub fn record_aggregation_descendants(
    provenance: &ProvenanceStore,
    grid: &str,
    field: &str,
    year: i32,
    success: bool,
    outputs: &[(TimeScale, PathBuf)],
) -> Result<(), CatalogError> {
    let docs = provenance.descendants(&year.to_string())?;
    for doc in docs {
        let Some(date) = doc.get("date").and_then(Value::as_str) else {
            continue;
        };
        let hemisphere: Option<Hemisphere> = doc
            .get("hemisphere")
            .and_then(|h| serde_json::from_value(h.clone()).ok());

        let mut fields = Document::new();
        fields.insert("all_aggregation_success".into(), success.into());
        for (scale, path) in outputs {
            fields.insert(
                format!("{grid}_{field}_aggregated_{scale}_path"),
                path.to_string_lossy().to_string().into(),
            );
        }
        provenance.update_descendants(date, hemisphere, fields)?;
    }
    Ok(())
}

/// Years with transformations onto `grid` that have never been aggregated,
/// or that have a transformation completed after the last aggregation.
pub fn years_to_aggregate(provenance: &ProvenanceStore, grid: &str) -> Result<Vec<i32>, CatalogError> {
    let transformations = provenance.transformations_for_grid(grid, None)?;
    let mut years = BTreeSet::new();
    for t in &transformations {
        match utils::parse_catalog_date(&t.date) {
            Ok(d) => {
                years.insert(d.year());
            }
            Err(e) => log::warn!("Ignoring transformation with bad date: {e}"),
        }
    }

    let mut out = vec![];
    for year in years {
        let aggs = provenance.aggregations(grid, year)?;
        let last_aggregated = aggs.iter().map(|a| a.aggregation_time).max();
        let needed = match last_aggregated {
            None => true,
            Some(agg_time) => transformations.iter().any(|t| {
                utils::parse_catalog_date(&t.date).map(|d| d.year()).ok() == Some(year)
                    && t.transformation_completed.map(|c| c > agg_time).unwrap_or(false)
            }),
        };
        if needed {
            out.push(year);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::DateSeriesAssembler;
    use crate::assembler::{RecordLocator, TransformedRecordSource};
    use crate::catalog::InMemoryCatalog;
    use crate::records::TransformedRecord;
    use crate::test_utils::{daily_config, granule_doc, latlon_grid, provenance, test_field};
    use chrono::{NaiveDate, TimeZone, Utc};

    struct NoRecords;

    impl TransformedRecordSource for NoRecords {
        fn find(&self, _: &str, _: &str, _: NaiveDate) -> Result<Vec<RecordLocator>, CatalogError> {
            Ok(vec![])
        }

        fn load(&self, l: &RecordLocator) -> Result<TransformedRecord, RecordIoError> {
            Err(RecordIoError::could_not_read(&l.path, "no records"))
        }
    }

    fn empty_daily_series(year: i32) -> AnnualSeries {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 1.0], &[0.0], 100e3);
        DateSeriesAssembler::new(&NoRecords, &config, &grid, &CalendarWindow)
            .assemble(&test_field(), year)
            .unwrap()
    }

    #[test]
    fn test_empty_year_aggregate() {
        let agg = AnnualAggregate::from_series(&empty_daily_series(2010)).unwrap();
        assert_eq!(agg.values.shape(), &[365, 1, 2]);
        assert!(agg.is_empty_year());
        assert_eq!(agg.valid_min, None);
        assert_eq!(agg.attrs["time_coverage_start"], "2010-01-01T00:00:00");
        assert_eq!(agg.attrs["time_coverage_end"], "2011-01-01T00:00:00");
        assert_eq!(agg.file_stem(), "sst_g_DAILY_2010");
    }

    #[test]
    fn test_monthly_roll_up() {
        let mut agg = AnnualAggregate::from_series(&empty_daily_series(2010)).unwrap();
        // Give January cell 0 the values 1..=31
        for d in 0..31 {
            agg.values[[d, 0, 0]] = (d + 1) as f64;
        }
        let monthly = agg.monthly_roll_up().unwrap();
        assert_eq!(monthly.values.shape(), &[12, 1, 2]);
        approx::assert_abs_diff_eq!(monthly.values[[0, 0, 0]], 16.0);
        assert!(monthly.values[[1, 0, 0]].is_nan());
        assert_eq!(monthly.valid_min, Some(16.0));
        assert_eq!(monthly.time_scale, TimeScale::Monthly);
        assert_eq!(monthly.time_bounds[11][1], NaiveDate::from_ymd_opt(2011, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_json_sink() {
        let dir = tempfile::tempdir().unwrap();
        let agg = AnnualAggregate::from_series(&empty_daily_series(2011)).unwrap();
        let path = JsonAggregationSink::new(dir.path()).save(&agg).unwrap();
        assert!(path.ends_with("TEST_DAILY/transformed_products/g/aggregated/sst/sst_g_DAILY_2011.json"));
    }

    #[test]
    fn test_aggregate_carries_uuid() {
        let agg = AnnualAggregate::from_series(&empty_daily_series(2010)).unwrap();
        assert_eq!(agg.attrs["uuid"], Value::from(agg.uuid.to_string()));
        assert_eq!(agg.attrs["time_coverage_duration"], "P1Y");
        let monthly = agg.monthly_roll_up().unwrap();
        assert_ne!(monthly.uuid, agg.uuid);
        assert_eq!(monthly.attrs["uuid"], Value::from(monthly.uuid.to_string()));
    }

    #[test]
    fn test_descendants_list_used_transformations() {
        let cat = InMemoryCatalog::with_documents(vec![
            granule_doc("TEST_DAILY", "/h/a_20110102.nc", "2011-01-02T00:00:00Z", "c1"),
            granule_doc("TEST_DAILY", "/h/a_20110103.nc", "2011-01-03T00:00:00Z", "c2"),
        ]);
        let store = ProvenanceStore::new(&cat, "TEST_DAILY");

        let mut used = provenance("TEST_DAILY", "g", "sst", "/h/a_20110102.nc", "2011-01-02T00:00:00Z");
        used.transformation_file_path = Some("/t/a_20110102_sst.json".into());
        let mut unused = provenance("TEST_DAILY", "g", "sst", "/h/a_20110103.nc", "2011-01-03T00:00:00Z");
        unused.transformation_file_path = Some("/t/a_20110103_sst.json".into());
        let mut other_field = used.clone();
        other_field.field = "ice".into();
        other_field.transformation_file_path = Some("/t/a_20110102_ice.json".into());
        for p in [&used, &unused, &other_field] {
            store.record_transformation(p).unwrap();
        }
        store
            .record_aggregation(&AggregationProvenance {
                id: None,
                dataset: "TEST_DAILY".into(),
                grid_name: "g".into(),
                field: "sst".into(),
                year: 2011,
                success: true,
                aggregation_time: Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap(),
                output_paths: vec![],
                notes: String::new(),
            })
            .unwrap();

        let mut series = empty_daily_series(2011);
        series.sources = vec![RecordLocator {
            path: "/t/a_20110102_sst.json".into(),
            date: NaiveDate::from_ymd_opt(2011, 1, 2).unwrap(),
            hemisphere: None,
        }];

        let report = DescendantsReport::collect(&store, &series).unwrap();
        assert_eq!(report.transformations.len(), 1);
        let lineage = &report.transformations[0];
        assert_eq!(
            lineage.transformation.transformation_file_path.as_deref(),
            Some(Path::new("/t/a_20110102_sst.json"))
        );
        assert_eq!(lineage.harvested.len(), 1);
        assert_eq!(lineage.harvested[0].checksum, "c1");
        assert_eq!(report.aggregation.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = JsonAggregationSink::new(dir.path())
            .save_descendants(&series, &report)
            .unwrap();
        assert!(path.ends_with("TEST_DAILY/transformed_products/g/aggregated/sst/TEST_DAILY_sst_g_2011_descendants.json"));
        let written: DescendantsReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, report);
    }

    #[test]
    fn test_aggregation_marks_descendants() {
        let cat = InMemoryCatalog::new();
        let store = ProvenanceStore::new(&cat, "TEST_DAILY");
        let mut fields = Document::new();
        fields.insert("all_transformations_success".into(), true.into());
        store.update_descendants("2011-01-02T00:00:00Z", None, fields.clone()).unwrap();
        store.update_descendants("2012-01-02T00:00:00Z", None, fields).unwrap();

        let out = PathBuf::from("/agg/sst_g_DAILY_2011.json");
        record_aggregation_descendants(&store, "g", "sst", 2011, true, &[(TimeScale::Daily, out)]).unwrap();

        let docs = store.descendants("2011").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["all_aggregation_success"], true);
        assert_eq!(docs[0]["all_transformations_success"], true);
        assert_eq!(docs[0]["g_sst_aggregated_daily_path"], "/agg/sst_g_DAILY_2011.json");
        assert!(store.descendants("2012").unwrap()[0].get("all_aggregation_success").is_none());
    }

    #[test]
    fn test_years_to_aggregate() {
        let cat = InMemoryCatalog::new();
        let store = ProvenanceStore::new(&cat, "TEST");
        let mut p2010 = provenance("TEST", "g", "sst", "/a/x_2010.json", "2010-03-01T00:00:00Z");
        p2010.transformation_completed = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut p2011 = provenance("TEST", "g", "sst", "/a/x_2011.json", "2011-03-01T00:00:00Z");
        p2011.transformation_completed = Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap());
        store.record_transformation(&p2010).unwrap();
        store.record_transformation(&p2011).unwrap();
        assert_eq!(years_to_aggregate(&store, "g").unwrap(), vec![2010, 2011]);

        for year in [2010, 2011] {
            store
                .record_aggregation(&AggregationProvenance {
                    id: None,
                    dataset: "TEST".into(),
                    grid_name: "g".into(),
                    field: "sst".into(),
                    year,
                    success: true,
                    aggregation_time: Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap(),
                    output_paths: vec![],
                    notes: String::new(),
                })
                .unwrap();
        }
        // Only 2011 has a transformation newer than its aggregation
        assert_eq!(years_to_aggregate(&store, "g").unwrap(), vec![2011]);
    }
}
