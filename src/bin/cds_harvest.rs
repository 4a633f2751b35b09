use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use cds_harvest::archive::CdsHttpClient;
use cds_harvest::config::{CombinationFilter, ConfigLoader, ResolvedCatalog, Settings};
use cds_harvest::domain::Combination;
use cds_harvest::error::HarvestError;
use cds_harvest::extract::Extractor;
use cds_harvest::fetcher::Fetcher;
use cds_harvest::object_store::{FilesystemObjectStore, ObjectStoreClient, S3ObjectStore, S3Options};
use cds_harvest::output::{JsonOutput, LogSink, OutputMode};
use cds_harvest::pipeline::{BatchReport, CombinationStatus, Pipeline, ProgressSink, plan};
use cds_harvest::staging::StagingArea;
use cds_harvest::uploader::Uploader;

#[derive(Parser)]
#[command(name = "cds-harvest")]
#[command(about = "Harvest Climate Data Store products into S3")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    catalog: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, upload and optionally extract every selected combination")]
    Run(RunArgs),
    #[command(about = "Show requests and storage keys without contacting any service")]
    Plan(SelectArgs),
    #[command(about = "List the sensors in the catalog")]
    Sensors,
}

#[derive(Args, Clone)]
struct SelectArgs {
    #[arg(long = "sensor")]
    sensors: Vec<String>,

    #[arg(long = "year")]
    years: Vec<String>,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    select: SelectArgs,

    #[arg(long, env = "CDS_HARVEST_BUCKET")]
    bucket: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    extract_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    staging_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    local_store: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::MissingCredentials(_)
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidRequest { .. }
        | HarvestError::InvalidKeyComponent { .. }
        | HarvestError::UnknownSensor(_) => 2,
        err if err.is_remote() => 3,
        HarvestError::ObjectStore(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let catalog = ConfigLoader::resolve(cli.catalog.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_batch(args, catalog, output_mode),
        Commands::Plan(args) => run_plan(args, &catalog, output_mode),
        Commands::Sensors => run_sensors(&catalog, output_mode),
    }
}

fn filter_from(args: &SelectArgs) -> CombinationFilter {
    CombinationFilter {
        sensors: args.sensors.clone(),
        years: args.years.clone(),
    }
}

fn run_plan(args: SelectArgs, catalog: &ResolvedCatalog, mode: OutputMode) -> miette::Result<()> {
    let combinations = catalog.combinations(&filter_from(&args))?;
    let planned = plan(catalog, &combinations)?;
    match mode {
        OutputMode::Json => JsonOutput::print_plan(&planned).into_diagnostic()?,
        OutputMode::Text => {
            for entry in &planned {
                println!("{}  ->  {}", entry.combination, entry.key);
            }
            println!("{} combinations", planned.len());
        }
    }
    Ok(())
}

fn run_sensors(catalog: &ResolvedCatalog, mode: OutputMode) -> miette::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print_sensors(&catalog.sensors).into_diagnostic()?,
        OutputMode::Text => {
            for sensor in &catalog.sensors {
                println!(
                    "{:<20} {:<22} {} {} years {}..{}",
                    sensor.name,
                    sensor.template.sensor,
                    sensor.template.level,
                    sensor.template.dataset,
                    sensor.years.first().map(String::as_str).unwrap_or("-"),
                    sensor.years.last().map(String::as_str).unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn run_batch(args: RunArgs, catalog: ResolvedCatalog, mode: OutputMode) -> miette::Result<()> {
    let bucket = args
        .bucket
        .clone()
        .or_else(|| args.local_store.as_ref().map(|_| "local".to_string()));
    let settings = Settings::from_env(bucket)?;
    let combinations = catalog.combinations(&filter_from(&args.select))?;
    let workers = args.workers.unwrap_or(catalog.workers).max(1);

    let archive = CdsHttpClient::new(
        &settings.archive_url,
        &settings.archive_key,
        settings.timeout,
    )?;
    let staging = match &args.staging_dir {
        Some(dir) => StagingArea::new(dir.clone()),
        None => StagingArea::system()?,
    };
    let fetcher = Fetcher::new(archive, staging, catalog.retry.clone());

    let report = match &args.local_store {
        Some(root) => {
            let store = FilesystemObjectStore::new(root.clone());
            execute(catalog, fetcher, store, &settings, &args, &combinations, workers, mode)
        }
        None => {
            let store = S3ObjectStore::new(&S3Options {
                region: settings.region.clone(),
                endpoint: settings.endpoint.clone(),
            })?;
            execute(catalog, fetcher, store, &settings, &args, &combinations, workers, mode)
        }
    };

    match mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Text => print_summary(&report),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn execute<S: ObjectStoreClient>(
    catalog: ResolvedCatalog,
    fetcher: Fetcher<CdsHttpClient>,
    store: S,
    settings: &Settings,
    args: &RunArgs,
    combinations: &[Combination],
    workers: usize,
    mode: OutputMode,
) -> BatchReport {
    let uploader = Uploader::new(store, settings.bucket.clone(), catalog.min_artifact_bytes);
    let mut pipeline = Pipeline::new(catalog, fetcher, uploader);
    if let Some(dir) = &args.extract_dir {
        pipeline = pipeline.with_extractor(Extractor::new(dir.clone()));
    }
    let sink: &dyn ProgressSink = match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &LogSink,
    };
    pipeline.run(combinations, workers, sink)
}

fn print_summary(report: &BatchReport) {
    println!("cds-harvest summary");
    println!("  uploaded: {}", report.uploaded);
    println!("  skipped (empty): {}", report.skipped);
    println!("  failed: {}", report.failed);
    if report.extract_failures > 0 {
        println!("  extraction errors: {}", report.extract_failures);
    }

    for item in &report.items {
        let label = match item.status {
            CombinationStatus::Uploaded => "uploaded",
            CombinationStatus::Skipped => "skipped",
            CombinationStatus::Failed => "FAILED",
        };
        println!(
            "  {label:<8} {} {} {} {}",
            item.sensor,
            item.variable,
            item.year,
            item.key.as_deref().unwrap_or("-")
        );
        if let Some(error) = &item.error {
            println!("           {error}");
        }
        for member in &item.extracted {
            println!("           extracted {}", member.path);
        }
    }
}
