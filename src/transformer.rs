//! Transforming one source granule onto one target grid.
//!
//! Each configured field goes through the same steps: pre-transformation
//! hooks, mapping, post-transformation hooks, then record construction (valid
//! range, fill substitution, time bounds, metadata). A failure at any step
//! affects only that field, which gets an empty record in place of real data.
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, error, info, warn};
use ndarray::ArrayD;

use crate::config::{DatasetConfig, FieldInfo};
use crate::error::{DateTimeError, TransformError};
use crate::factors::MappingFactors;
use crate::grid::Grid;
use crate::hooks::HookRegistry;
use crate::mapper::{map_field, MappingOutcome};
use crate::records::{EmptyRecordFactory, TransformedRecord, EMPTY_RECORD_NOTE};
use crate::source::{SourceDataset, SourceRecord};
use crate::time_bounds::TimeBoundsRule;

/// Where a field's transformation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransformState {
    Pending,
    Mapping,
    PostProcessing,
    Stamped,
    Done,
    EmptySubstituted,
}

/// The result of mapping a field, before it becomes a record.
#[derive(Debug)]
pub enum FieldOutcome {
    Mapped(ArrayD<f64>),
    /// The source field has no valid values anywhere
    NoValidData,
    /// The granule does not carry the field's variable. This is a gap in the
    /// data rather than a failure, so the attempt is still successful.
    VariableAbsent,
    Failed(TransformError),
}

/// The transformed record for one field and how it was produced.
#[derive(Debug)]
pub struct FieldTransform {
    pub field_name: String,
    pub record: TransformedRecord,
    /// What provenance should record for this attempt
    pub success: bool,
    pub state: TransformState,
    pub failure: Option<TransformError>,
}

pub struct GranuleTransformer<'a> {
    config: &'a DatasetConfig,
    grid: &'a Grid,
    factors: &'a MappingFactors,
    hooks: &'a HookRegistry,
    bounds_rule: &'a dyn TimeBoundsRule,
}

impl<'a> GranuleTransformer<'a> {
    pub fn new(
        config: &'a DatasetConfig,
        grid: &'a Grid,
        factors: &'a MappingFactors,
        hooks: &'a HookRegistry,
        bounds_rule: &'a dyn TimeBoundsRule,
    ) -> Self {
        Self {
            config,
            grid,
            factors,
            hooks,
            bounds_rule,
        }
    }

    /// Transform each of `fields` from `source`. Always returns one
    /// [`FieldTransform`] per field; only a granule date that cannot be
    /// turned into time bounds is an error.
    pub fn transform(
        &self,
        granule: &SourceRecord,
        source: &SourceDataset,
        fields: &[FieldInfo],
    ) -> Result<Vec<FieldTransform>, DateTimeError> {
        let date = granule.date()?;
        fields
            .iter()
            .map(|field| self.transform_field(granule, date, source, field))
            .collect()
    }

    fn transform_field(
        &self,
        granule: &SourceRecord,
        date: NaiveDate,
        source: &SourceDataset,
        field: &FieldInfo,
    ) -> Result<FieldTransform, DateTimeError> {
        let mut state = TransformState::Pending;
        let outcome = self.map_one(source, field, &mut state);
        let factory = EmptyRecordFactory::new(self.config, self.grid, self.bounds_rule);
        let filename = granule.file_name();
        let record_time: Option<NaiveDateTime> = source.time;

        let (record, success, failure) = match outcome {
            FieldOutcome::Mapped(values) => {
                let rec = factory.record_from_values(
                    field,
                    date,
                    granule.hemisphere,
                    record_time,
                    values,
                    &self.config.notes,
                    filename,
                )?;
                state = TransformState::Stamped;
                debug!("Transformed {} onto {} for {date}", field.name, self.grid.name);
                (rec, true, None)
            }
            FieldOutcome::NoValidData => {
                info!(
                    "{} on {} for {date}: the source field has no valid values; using an empty record",
                    field.name, self.grid.name
                );
                let mut rec = factory.empty_record(field, date, granule.hemisphere, record_time, EMPTY_RECORD_NOTE)?;
                rec.attrs.original_filename = filename;
                state = TransformState::EmptySubstituted;
                (rec, true, None)
            }
            FieldOutcome::VariableAbsent => {
                let err = TransformError::missing_source_variable(&field.name);
                warn!("{} on {} for {date}: {err}; using an empty record", field.name, self.grid.name);
                let mut rec = factory.empty_record(field, date, granule.hemisphere, record_time, "")?;
                rec.attrs.original_filename = filename;
                state = TransformState::EmptySubstituted;
                (rec, true, Some(err))
            }
            FieldOutcome::Failed(err) => {
                error!("{} on {} for {date}: {err}; using an empty record", field.name, self.grid.name);
                let mut rec = factory.empty_record(field, date, granule.hemisphere, record_time, "")?;
                rec.attrs.original_filename = filename;
                state = TransformState::EmptySubstituted;
                (rec, false, Some(err))
            }
        };

        if state == TransformState::Stamped {
            state = TransformState::Done;
        }

        Ok(FieldTransform {
            field_name: field.name.clone(),
            record,
            success,
            state,
            failure,
        })
    }

    fn map_one(&self, source: &SourceDataset, field: &FieldInfo, state: &mut TransformState) -> FieldOutcome {
        let pre = match self.hooks.resolve_pre(&self.config.pre_steps_for(field)) {
            Ok(h) => h,
            Err(e) => return FieldOutcome::Failed(TransformError::hook_failure("pre", e)),
        };
        let post = match self.hooks.resolve_post(&self.config.post_steps_for(field)) {
            Ok(h) => h,
            Err(e) => return FieldOutcome::Failed(TransformError::hook_failure("post", e)),
        };

        let processed;
        let dataset = if pre.is_empty() {
            source
        } else {
            let mut ds = source.clone();
            for (name, hook) in pre {
                ds = match hook(ds) {
                    Ok(ds) => ds,
                    Err(e) => return FieldOutcome::Failed(TransformError::hook_failure(name, e)),
                };
            }
            processed = ds;
            &processed
        };

        *state = TransformState::Mapping;
        let Some(raw) = dataset.variables.get(&field.name) else {
            return FieldOutcome::VariableAbsent;
        };

        let raw = if self.config.transpose {
            // Source arrays carry a leading time axis; take the single step and
            // swap its remaining axes to match the source grid's point order.
            match raw.ndim() {
                n if n >= 2 => raw.index_axis(ndarray::Axis(0), 0).reversed_axes().to_owned(),
                _ => raw.clone(),
            }
        } else {
            raw.clone()
        };

        let mapped = match map_field(self.factors, raw.view(), self.grid.shape(), self.config.mapping_operation) {
            Ok(MappingOutcome::Mapped(values)) => values,
            Ok(MappingOutcome::AllMissing) => return FieldOutcome::NoValidData,
            Err(e) => return FieldOutcome::Failed(TransformError::mapping_failure(e)),
        };

        *state = TransformState::PostProcessing;
        let mut values = mapped;
        for (name, hook) in post {
            values = match hook(values, &field.name) {
                Ok(v) => v,
                Err(e) => return FieldOutcome::Failed(TransformError::hook_failure(name, e)),
            };
        }

        if values.shape() != self.grid.shape() {
            return FieldOutcome::Failed(TransformError::hook_failure(
                "post",
                format!(
                    "post-processing changed the shape to {:?}, expected {:?}",
                    values.shape(),
                    self.grid.shape()
                ),
            ));
        }

        FieldOutcome::Mapped(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookError;
    use crate::records::NETCDF_FILL_F32;
    use crate::spatial_index::{SourceGrid, SpatialIndexBuilder};
    use crate::test_utils::{daily_config, latlon_grid, source_record};
    use crate::time_bounds::CalendarWindow;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    struct Fixture {
        config: DatasetConfig,
        grid: Grid,
        factors: MappingFactors,
    }

    /// A 1x2 target grid at (0, 0) and (10, 0) over a 4-point source where the
    /// first two source points are near the first target and the others near
    /// the second.
    fn fixture() -> Fixture {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 10.0], &[0.0], 100e3);
        let source = SourceGrid::from_points(vec![-0.1, 0.1, 9.9, 10.1], vec![0.0; 4], 20e3, 20e3);
        let factors = SpatialIndexBuilder::default().build(&source, &grid).unwrap();
        Fixture { config, grid, factors }
    }

    fn run(fx: &Fixture, hooks: &HookRegistry, source: &SourceDataset) -> Vec<FieldTransform> {
        let granule = source_record("/data/g_20100703.json", "2010-07-03T00:00:00Z", "abc");
        GranuleTransformer::new(&fx.config, &fx.grid, &fx.factors, hooks, &CalendarWindow)
            .transform(&granule, source, &fx.config.fields)
            .unwrap()
    }

    #[test]
    fn test_successful_field() {
        let fx = fixture();
        let src = SourceDataset::default().with_variable("sst", arr1(&[1.0, 3.0, 10.0, f64::NAN]).into_dyn());
        let out = run(&fx, &HookRegistry::with_builtins(), &src);
        assert_eq!(out.len(), 1);
        let ft = &out[0];
        assert!(ft.success);
        assert_eq!(ft.state, TransformState::Done);
        assert_eq!(ft.record.values.shape(), &[1, 1, 2]);
        assert_abs_diff_eq!(ft.record.values[[0, 0, 0]], 2.0);
        assert_abs_diff_eq!(ft.record.values[[0, 0, 1]], 10.0);
        assert_eq!(ft.record.attrs.valid_min, Some(2.0));
        assert_eq!(ft.record.attrs.valid_max, Some(10.0));
        assert_eq!(ft.record.attrs.original_filename.as_deref(), Some("g_20100703.json"));
    }

    #[test]
    fn test_two_by_two_with_nearest_fallback() {
        let config = daily_config();
        let grid = latlon_grid("g", &[0.0, 10.0], &[0.0, 10.0], 50e3);
        // One source point at each of three target cells; the fourth target at
        // (10, 10) has nothing in range and falls back to the point at (12, 12).
        let source = SourceGrid::from_points(vec![0.0, 10.0, 0.0, 12.0], vec![0.0, 0.0, 10.0, 12.0], 20e3, 20e3);
        let factors = SpatialIndexBuilder::default().build(&source, &grid).unwrap();
        assert_eq!(factors.counts, vec![1, 1, 1, 0]);

        let granule = source_record("/data/g_20010315.json", "2001-03-15T00:00:00Z", "abc");
        let src = SourceDataset::default().with_variable("sst", arr1(&[1.0, 2.0, 3.0, 4.0]).into_dyn());
        let hooks = HookRegistry::with_builtins();
        let out = GranuleTransformer::new(&config, &grid, &factors, &hooks, &CalendarWindow)
            .transform(&granule, &src, &config.fields)
            .unwrap();

        let rec = &out[0].record;
        assert!(out[0].success);
        assert_eq!(rec.values.shape(), &[1, 2, 2]);
        assert_eq!(rec.values.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rec.attrs.valid_min, Some(1.0));
        assert_eq!(rec.attrs.valid_max, Some(4.0));
        let start = chrono::NaiveDate::from_ymd_opt(2001, 3, 15).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(rec.time_bounds, [start, start + chrono::Duration::days(1)]);
    }

    #[test]
    fn test_missing_variable_is_success() {
        let fx = fixture();
        let src = SourceDataset::default().with_variable("other", arr1(&[1.0; 4]).into_dyn());
        let hooks = HookRegistry::with_builtins();
        let transformer = GranuleTransformer::new(&fx.config, &fx.grid, &fx.factors, &hooks, &CalendarWindow);
        let mut state = TransformState::Pending;
        assert!(matches!(
            transformer.map_one(&src, &fx.config.fields[0], &mut state),
            FieldOutcome::VariableAbsent
        ));

        let ft = &run(&fx, &hooks, &src)[0];
        assert!(ft.success);
        assert_eq!(ft.state, TransformState::EmptySubstituted);
        assert!(matches!(ft.failure, Some(TransformError::MissingSourceVariable { .. })));
        assert!(ft.record.is_all_missing());
    }

    #[test]
    fn test_all_missing_source_is_empty_success() {
        let fx = fixture();
        let src = SourceDataset::default().with_variable("sst", arr1(&[f64::NAN; 4]).into_dyn());
        let ft = &run(&fx, &HookRegistry::with_builtins(), &src)[0];
        assert!(ft.success);
        assert!(ft.failure.is_none());
        assert_eq!(ft.record.attrs.notes, EMPTY_RECORD_NOTE);
        assert!(ft.record.values.iter().all(|&v| v == NETCDF_FILL_F32 as f64));
    }

    fn failing_post(_: ArrayD<f64>, _: &str) -> Result<ArrayD<f64>, HookError> {
        Err(HookError::new("boom"))
    }

    #[test]
    fn test_post_hook_failure_marks_failed() {
        let mut fx = fixture();
        fx.config.post_transformation_steps = vec!["fail".to_string()];
        let mut hooks = HookRegistry::with_builtins();
        hooks.register_post("fail", failing_post);

        let src = SourceDataset::default().with_variable("sst", arr1(&[1.0, 3.0, 10.0, 12.0]).into_dyn());
        let ft = &run(&fx, &hooks, &src)[0];
        assert!(!ft.success);
        assert_eq!(ft.state, TransformState::EmptySubstituted);
        match &ft.failure {
            Some(TransformError::HookFailure { hook, reason }) => {
                assert_eq!(hook, "fail");
                assert_eq!(reason, "boom");
            }
            other => panic!("Expected a hook failure, got {other:?}"),
        }
        // Same scaffolding as a real record
        assert_eq!(ft.record.values.shape(), &[1, 1, 2]);
    }

    #[test]
    fn test_mapping_failure_marks_failed() {
        let fx = fixture();
        // Wrong number of source values for the factors
        let src = SourceDataset::default().with_variable("sst", arr1(&[1.0, 2.0]).into_dyn());
        let ft = &run(&fx, &HookRegistry::with_builtins(), &src)[0];
        assert!(!ft.success);
        assert!(matches!(ft.failure, Some(TransformError::MappingFailure(_))));
    }

    #[test]
    fn test_transpose() {
        let mut fx = fixture();
        fx.config.transpose = true;
        // Leading time axis of 1, then a 2x2 array whose transpose flattens
        // to the source point order [1, 3, 10, 12].
        let raw = ndarray::Array::from_shape_vec((1, 2, 2), vec![1.0, 10.0, 3.0, 12.0])
            .unwrap()
            .into_dyn();
        let src = SourceDataset::default().with_variable("sst", raw);
        let ft = &run(&fx, &HookRegistry::with_builtins(), &src)[0];
        assert!(ft.success);
        assert_abs_diff_eq!(ft.record.values[[0, 0, 0]], 2.0);
        assert_abs_diff_eq!(ft.record.values[[0, 0, 1]], 11.0);
    }
}
