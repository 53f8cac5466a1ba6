use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use error_stack::ResultExt;
use granule_regrid::{
    catalog::JsonFileCatalog,
    cli::{CliError, LoggingCli},
    config::DatasetConfig,
    factors::FactorsCache,
    grid::{DirGridStore, GridStore},
    hooks::HookRegistry,
    records::JsonRecordStore,
    scheduler::{RunSummary, TransformationScheduler},
    source::JsonSourceReader,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use tabled::{settings::Style, Table, Tabled};

/// Regrid every harvested granule of a dataset onto a set of target grids.
///
/// Granules already transformed with the current transformation version and
/// an unchanged source checksum are skipped, so rerunning after a failure
/// only redoes the missing work.
#[derive(Debug, clap::Parser)]
struct TransformCli {
    /// Dataset configuration TOML file. Top-level keys may be overridden by
    /// GRANULE_REGRID_* environment variables.
    config: PathBuf,

    /// JSON file holding the catalog of granule and provenance documents
    #[clap(short = 'c', long)]
    catalog: PathBuf,

    /// Directory containing the target grid definitions (<name>.json)
    #[clap(short = 'g', long)]
    grids_dir: PathBuf,

    /// Root directory for transformed records and cached mapping factors
    #[clap(short = 'o', long)]
    output_dir: PathBuf,

    /// Only transform onto these grids; may be repeated. Default is every
    /// grid in --grids-dir.
    #[clap(long = "grid")]
    grids: Vec<String>,

    /// Number of worker threads. Overrides the configuration's `workers`.
    #[clap(short = 'j', long)]
    workers: Option<usize>,

    /// Hide the progress bar
    #[clap(long)]
    no_progress: bool,

    #[command(flatten)]
    logging: LoggingCli,
}

fn main() -> ExitCode {
    let clargs = TransformCli::parse();
    if let Err(e) = clargs.logging.init() {
        eprintln!("Could not set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match driver(clargs) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            eprintln!("\nThe granule transformation failed:\n\n{e:?}\n");
            eprintln!("{}", e.current_context());
            ExitCode::FAILURE
        }
    }
}

fn driver(clargs: TransformCli) -> error_stack::Result<RunSummary, CliError> {
    let hooks = HookRegistry::with_builtins();
    let config = DatasetConfig::load(&clargs.config)
        .change_context_lazy(|| CliError::input_error("could not load the dataset configuration"))?;
    config.validate(&hooks).change_context_lazy(|| {
        CliError::input_error(format!("the configuration in {} is invalid", clargs.config.display()))
    })?;

    let catalog = JsonFileCatalog::open(&clargs.catalog).change_context_lazy(|| {
        CliError::input_error(format!("could not open the catalog {}", clargs.catalog.display()))
    })?;

    let grid_store = DirGridStore::new(&clargs.grids_dir);
    let grids = if clargs.grids.is_empty() {
        grid_store
            .available()
            .change_context_lazy(|| CliError::input_error("could not list the available grids"))?
    } else {
        clargs.grids.clone()
    };
    if grids.is_empty() {
        return Err(CliError::usage_error(format!(
            "no grids to transform onto; {} contains no grid files",
            clargs.grids_dir.display()
        ))
        .into());
    }
    info!("Transforming {} onto {} grid(s): {}", config.ds_name, grids.len(), grids.join(", "));

    let factors = FactorsCache::new(&clargs.output_dir, config.ds_name.clone());
    let config = Arc::new(config);
    let mut scheduler = TransformationScheduler::new(
        Arc::clone(&config),
        Arc::new(catalog),
        Arc::new(grid_store),
        Arc::new(factors),
        Arc::new(JsonSourceReader),
        Arc::new(JsonRecordStore::new(&clargs.output_dir)),
        Arc::new(hooks),
    );
    if let Some(n) = clargs.workers {
        scheduler = scheduler.with_workers(n);
    }

    let pb = if clargs.no_progress {
        ProgressBar::hidden()
    } else {
        let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} granules ({eta})")
            .map_err(|e| CliError::internal_error(format!("bad progress bar template: {e}")))?
            .progress_chars("=> ");
        ProgressBar::new(0).with_style(style).with_message(config.ds_name.clone())
    };

    scheduler.run(&grids, &pb).change_context_lazy(|| {
        CliError::runtime_error(format!("the transformation run for {} could not complete", config.ds_name))
    })
}

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "")]
    item: &'static str,
    #[tabled(rename = "count")]
    count: String,
}

fn print_summary(summary: &RunSummary) {
    let status = summary
        .status
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown (catalog not updated)".to_string());
    let rows = [
        ("granules", summary.granules.to_string()),
        ("skipped", summary.skipped.to_string()),
        ("up to date", summary.up_to_date.to_string()),
        ("fields transformed", summary.fields_succeeded.to_string()),
        ("fields failed", summary.fields_failed.to_string()),
        ("grids skipped", summary.grids_skipped.to_string()),
        ("status", status),
    ]
    .into_iter()
    .map(|(item, count)| SummaryRow { item, count });

    let mut table = Table::new(rows);
    table.with(Style::blank());
    println!("{table}");
}
