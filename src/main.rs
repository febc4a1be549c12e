//! # Trackfuse CLI
//!
//! Command-line interface for the trackfuse library.
//! Reads a track file, enriches it and writes a `;`-separated table.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, LevelFilter};
use trackfuse::{formats, Config, EnrichOptions, InterpolationPolicy, Pipeline, RunContext};

mod cli;

/// Command-line interface for trackfuse
#[derive(Parser, Debug)]
#[command(name = "trackfuse")]
#[command(about = "GPS track enrichment and fixed-interval resampling")]
#[command(long_about = "Filters a GPS track, snaps it to the road network, attaches way/node tags
and terrain elevation, then resamples it onto a uniform grid:
  trackfuse ride.gpx --distance 10              # one row every 10 m
  trackfuse ride.csv --duration 5 -o out.csv    # one row every 5 s
  trackfuse ride.gpx --distance 25 --policy way_highway=hold --way-tags highway,maxspeed

Service endpoints come from the config file or the OSRM_API_URL,
OPEN_ELEVATION_API_URL and OVERPASS_API_URL environment variables.")]
#[command(version = env!("TRACKFUSE_VERSION"))]
struct Cli {
    /// Track file (gpx, kml, tcx, geojson, csv or json)
    input: PathBuf,

    /// Output file path, or "-" for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sample every N metres of travelled distance
    #[arg(long, conflicts_with = "duration")]
    distance: Option<f64>,

    /// Sample every N seconds of elapsed time
    #[arg(long)]
    duration: Option<f64>,

    /// Interpolation policy for a column, as column=policy (repeatable)
    #[arg(long = "policy", value_name = "COLUMN=POLICY")]
    policies: Vec<String>,

    /// Copy these way tag keys into columns (comma-separated)
    #[arg(long, value_delimiter = ',')]
    way_tags: Vec<String>,

    /// Copy these node tag keys into columns (comma-separated)
    #[arg(long, value_delimiter = ',')]
    node_tags: Vec<String>,

    /// Fail on degraded results instead of recording diagnostics
    #[arg(long)]
    strict: bool,

    /// Skip map matching
    #[arg(long)]
    no_match: bool,

    /// Skip way/node metadata
    #[arg(long)]
    no_metadata: bool,

    /// Skip elevation lookup
    #[arg(long)]
    no_elevation: bool,

    /// Write the standardized table without resampling
    #[arg(long)]
    no_segmentation: bool,

    /// Validate the input and configuration, print the effective configuration and exit
    #[arg(long)]
    dry_run: bool,

    /// Hide progress bars
    #[arg(short, long)]
    quiet: bool,

    /// Enable verbose logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Parse a `column=policy` argument
fn parse_policy(raw: &str) -> anyhow::Result<(String, InterpolationPolicy)> {
    let Some((column, policy)) = raw.split_once('=') else {
        bail!("invalid --policy '{raw}', expected COLUMN=POLICY");
    };
    let column = column.trim();
    if column.is_empty() {
        bail!("invalid --policy '{raw}', the column name is empty");
    }
    Ok((column.to_string(), policy.trim().parse()?))
}

/// Configuration from file and environment, overridden by flags
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = config.with_env_overrides()?;

    if cli.distance.is_some() || cli.duration.is_some() {
        config.segmentation.distance_m = cli.distance;
        config.segmentation.duration_s = cli.duration;
    }
    for raw in &cli.policies {
        let (column, policy) = parse_policy(raw)?;
        config.segmentation.columns.insert(column, policy);
    }
    if !cli.way_tags.is_empty() {
        config.metadata.way_columns = cli.way_tags.clone();
    }
    if !cli.node_tags.is_empty() {
        config.metadata.node_columns = cli.node_tags.clone();
    }
    config.network.strict |= cli.strict;
    config.stages.matching &= !cli.no_match;
    config.stages.metadata &= !cli.no_metadata;
    config.stages.elevation &= !cli.no_elevation;
    config.stages.segmentation &= !cli.no_segmentation;
    Ok(config)
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = log_level(cli.verbose);

    // Initialize logging to stderr; RUST_LOG still wins when set
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose > 0 {
        eprintln!("🛰️ Trackfuse v{} starting...", env!("TRACKFUSE_VERSION"));
    }

    let config = build_config(&cli)?;
    let route = formats::read_route(&cli.input).with_context(|| format!("reading {}", cli.input.display()))?;
    let enrichers = EnrichOptions::from_config(&config.metadata);
    let strict = config.network.strict;

    if cli.dry_run {
        config.validate()?;
        eprintln!(
            "🔍 [DRY RUN] {} points read from {}",
            route.len(),
            cli.input.display()
        );
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let pipeline = Pipeline::from_config(config, enrichers)?;
    let progress = if cli.quiet {
        cli::ProgressManager::hidden()
    } else {
        cli::ProgressManager::new()
    };
    let ctx = RunContext::new(route.id.clone())
        .with_level(level)
        .with_strict(strict)
        .with_progress(progress.callback());

    let output = pipeline.run(&route, &ctx).await;
    progress.finish();
    let output = output?;

    for diagnostic in output.diagnostics() {
        log::info!("{diagnostic}");
    }
    if !output.diagnostics().is_empty() {
        eprintln!("⚠️ {} diagnostics recorded (use -v to list them)", output.diagnostics().len());
    }

    let table = output.table()?;
    if cli.output == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        formats::write_table(&table, &mut handle)?;
        handle.flush()?;
    } else {
        let file = File::create(&cli.output).with_context(|| format!("creating {}", cli.output))?;
        formats::write_table(&table, BufWriter::new(file))?;
        eprintln!("📁 {} rows written to {}", table.len(), cli.output);
    }

    Ok(())
}
