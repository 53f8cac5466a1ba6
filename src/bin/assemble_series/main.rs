use std::{path::PathBuf, process::ExitCode};

use chrono::Utc;
use clap::Parser;
use error_stack::ResultExt;
use granule_regrid::{
    aggregation::{
        record_aggregation_descendants, years_to_aggregate, AggregationSink, AnnualAggregate, DescendantsReport,
        JsonAggregationSink,
    },
    assembler::{CatalogRecordSource, DateSeriesAssembler},
    catalog::{AggregationProvenance, Catalog, JsonFileCatalog, ProvenanceStore},
    cli::{CliError, LoggingCli},
    config::{DatasetConfig, FieldInfo},
    grid::{DirGridStore, Grid, GridStore},
    hooks::HookRegistry,
    records::JsonRecordStore,
    time_bounds::{rule_for_dataset, TimeBoundsRule, TimeScale},
};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use tabled::{settings::Style, Table, Tabled};

/// Assemble transformed records into one series per (grid, field, year) and
/// save the annual aggregates.
///
/// Only years with transformations newer than their last aggregation are
/// processed unless --year is given.
#[derive(Debug, clap::Parser)]
struct AssembleCli {
    /// Dataset configuration TOML file
    config: PathBuf,

    /// JSON file holding the catalog of granule and provenance documents
    #[clap(short = 'c', long)]
    catalog: PathBuf,

    /// Directory containing the target grid definitions (<name>.json)
    #[clap(short = 'g', long)]
    grids_dir: PathBuf,

    /// Root directory holding the transformed records; aggregates are written
    /// under it as well
    #[clap(short = 'o', long)]
    output_dir: PathBuf,

    /// Only assemble these grids; may be repeated
    #[clap(long = "grid")]
    grids: Vec<String>,

    /// Assemble these years even if they are up to date; may be repeated
    #[clap(short = 'y', long = "year")]
    years: Vec<i32>,

    /// Number of worker threads. Overrides the configuration's `workers`.
    #[clap(short = 'j', long)]
    workers: Option<usize>,

    #[command(flatten)]
    logging: LoggingCli,
}

fn main() -> ExitCode {
    let clargs = AssembleCli::parse();
    if let Err(e) = clargs.logging.init() {
        eprintln!("Could not set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match driver(clargs) {
        Ok(rows) => {
            let n_failed = rows.iter().filter(|r| !r.success).count();
            let mut table = Table::new(rows);
            table.with(Style::psql());
            println!("{table}");
            if n_failed > 0 {
                eprintln!("{n_failed} aggregation(s) failed; see the log for details");
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("{e}");
            eprintln!("\nThe series assembly failed:\n\n{e:?}\n");
            eprintln!("{}", e.current_context());
            ExitCode::FAILURE
        }
    }
}

/// One (grid, field, year) to assemble.
struct Job<'a> {
    grid: &'a Grid,
    field: &'a FieldInfo,
    year: i32,
}

#[derive(Debug, Tabled)]
struct JobRow {
    grid: String,
    field: String,
    year: i32,
    #[tabled(rename = "records")]
    n_records: usize,
    #[tabled(rename = "empty year")]
    empty_year: bool,
    success: bool,
}

fn driver(clargs: AssembleCli) -> error_stack::Result<Vec<JobRow>, CliError> {
    let config = DatasetConfig::load(&clargs.config)
        .change_context_lazy(|| CliError::input_error("could not load the dataset configuration"))?;
    config.validate(&HookRegistry::with_builtins()).change_context_lazy(|| {
        CliError::input_error(format!("the configuration in {} is invalid", clargs.config.display()))
    })?;

    let catalog = JsonFileCatalog::open(&clargs.catalog).change_context_lazy(|| {
        CliError::input_error(format!("could not open the catalog {}", clargs.catalog.display()))
    })?;
    let provenance = ProvenanceStore::new(&catalog, &config.ds_name);

    let grid_store = DirGridStore::new(&clargs.grids_dir);
    let grid_names = if clargs.grids.is_empty() {
        grid_store
            .available()
            .change_context_lazy(|| CliError::input_error("could not list the available grids"))?
    } else {
        clargs.grids.clone()
    };

    let mut grids = vec![];
    for name in &grid_names {
        let grid = grid_store
            .load(name)
            .change_context_lazy(|| CliError::input_error(format!("could not load grid {name}")))?;
        let years = if clargs.years.is_empty() {
            years_to_aggregate(&provenance, name).change_context_lazy(|| {
                CliError::runtime_error(format!("could not determine which years of {name} need aggregating"))
            })?
        } else {
            clargs.years.clone()
        };
        info!("{name}: {} year(s) to aggregate", years.len());
        grids.push((grid, years));
    }

    let jobs: Vec<Job> = grids
        .iter()
        .flat_map(|(grid, years)| {
            config.fields.iter().flat_map(move |field| {
                years.iter().map(move |&year| Job {
                    grid: grid.as_ref(),
                    field,
                    year,
                })
            })
        })
        .collect();
    if jobs.is_empty() {
        info!("Nothing to aggregate for {}", config.ds_name);
        return Ok(vec![]);
    }

    let store = JsonRecordStore::new(&clargs.output_dir);
    let sink = JsonAggregationSink::new(&clargs.output_dir);
    let source = CatalogRecordSource::new(provenance, &store);
    let rule = rule_for_dataset(&config.ds_name, config.time_bounds_override);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(clargs.workers.unwrap_or_else(|| config.effective_workers()))
        .thread_name(|i| format!("regrid-worker-{i}"))
        .build()
        .change_context_lazy(|| CliError::runtime_error("could not start the worker pool"))?;

    let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} series")
        .map_err(|e| CliError::internal_error(format!("bad progress bar template: {e}")))?
        .progress_chars("=> ");
    let pb = ProgressBar::new(jobs.len() as u64)
        .with_style(style)
        .with_message(config.ds_name.clone());

    let rows: Vec<JobRow> = pool.install(|| {
        jobs.par_iter()
            .progress_with(pb.clone())
            .map(|job| run_job(job, &config, &source, rule.as_ref(), &sink, &catalog))
            .collect()
    });
    pb.finish_and_clear();
    Ok(rows)
}

/// Assemble, save, and record one series. Failures are logged and reported
/// in the returned row rather than stopping the other jobs.
fn run_job(
    job: &Job,
    config: &DatasetConfig,
    source: &CatalogRecordSource,
    rule: &dyn TimeBoundsRule,
    sink: &dyn AggregationSink,
    catalog: &dyn Catalog,
) -> JobRow {
    let mut row = JobRow {
        grid: job.grid.name.clone(),
        field: job.field.name.clone(),
        year: job.year,
        n_records: 0,
        empty_year: false,
        success: false,
    };
    let label = format!("{} on {} for {}", job.field.name, job.grid.name, job.year);

    let assembler = DateSeriesAssembler::new(source, config, job.grid, rule);
    let series = match assembler.assemble(job.field, job.year) {
        Ok(s) => s,
        Err(e) => {
            error!("Could not assemble {label}: {e}");
            return row;
        }
    };
    row.n_records = series.len();
    row.empty_year = series.is_empty_year();
    if row.empty_year {
        warn!("{label} has no transformed data; writing an all-missing year");
    }

    let agg = match AnnualAggregate::from_series(&series) {
        Ok(agg) => agg,
        Err(e) => {
            error!("Could not aggregate {label}: {e}");
            return row;
        }
    };
    let monthly = if config.do_monthly_aggregation && agg.time_scale == TimeScale::Daily {
        match agg.monthly_roll_up() {
            Ok(m) => Some(m),
            Err(e) => {
                error!("Could not compute the monthly means of {label}: {e}");
                return row;
            }
        }
    } else {
        None
    };
    let aggregates: Vec<AnnualAggregate> = std::iter::once(agg).chain(monthly).collect();

    let mut output_paths = vec![];
    let mut scaled_outputs = vec![];
    let mut success = true;
    for agg in &aggregates {
        match sink.save(agg) {
            Ok(path) => {
                scaled_outputs.push((agg.time_scale, path.clone()));
                output_paths.push(path);
            }
            Err(e) => {
                error!("{e}");
                success = false;
            }
        }
    }

    let notes = if row.empty_year {
        "no transformed records for this year".to_string()
    } else {
        String::new()
    };
    let prov = AggregationProvenance {
        id: None,
        dataset: config.ds_name.clone(),
        grid_name: job.grid.name.clone(),
        field: job.field.name.clone(),
        year: job.year,
        success,
        aggregation_time: Utc::now(),
        output_paths,
        notes,
    };
    let provenance = ProvenanceStore::new(catalog, &config.ds_name);
    if let Err(e) = provenance.record_aggregation(&prov) {
        error!("Could not record the aggregation of {label}: {e}");
        success = false;
    }

    match DescendantsReport::collect(&provenance, &series) {
        Ok(report) => {
            if let Err(e) = sink.save_descendants(&series, &report) {
                error!("Could not export the descendants of {label}: {e}");
                success = false;
            }
        }
        Err(e) => {
            error!("Could not gather the descendants of {label}: {e}");
            success = false;
        }
    }
    if let Err(e) = record_aggregation_descendants(
        &provenance,
        &job.grid.name,
        &job.field.name,
        job.year,
        success,
        &scaled_outputs,
    ) {
        error!("Could not update the descendants documents for {label}: {e}");
        success = false;
    }

    row.success = success;
    row
}
