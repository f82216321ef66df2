//! giztoy-export - exports a waveform model and converts the export.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use giztoy_export::{CommandConverter, ExportArtifact, OverwritePolicy, Pipeline, WorkerModel};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Exports a pretrained waveform model to a fixed-signature artifact and
/// converts it with an external converter.
///
/// The model is served by an inference worker process and the converter
/// is an external program; both are configured in the config file
/// (default ./export.yaml).
#[derive(Parser)]
#[command(name = "giztoy-export")]
#[command(about = "Waveform model export tool")]
#[command(version)]
pub struct Cli {
    /// Config file, YAML or JSON (default is ./export.yaml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export and convert a model
    Run(RunArgs),
    /// Print the manifest of an export artifact
    Inspect(InspectArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Pretrained model directory (overrides worker.model_dir)
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Export artifact directory
    #[arg(long)]
    pub export_dir: Option<PathBuf>,

    /// Converted model file
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Replace an existing export artifact
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    /// Export artifact directory
    pub dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Run(args) => run(&cli, args),
        Commands::Inspect(args) => inspect(args),
    }
}

fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let cfg = config::load(cli.config.as_deref())?;

    let mut worker = cfg
        .worker
        .context("no worker configured: add a `worker` section to the config file")?;
    if let Some(dir) = &args.model_dir {
        worker.model_dir = dir.clone();
    }
    let converter = cfg
        .converter
        .context("no converter configured: add a `converter` section to the config file")?;

    let mut pipeline_cfg = cfg.pipeline;
    if let Some(dir) = &args.export_dir {
        pipeline_cfg.export_dir = dir.clone();
    }
    if let Some(out) = &args.output {
        pipeline_cfg.converted_path = out.clone();
    }
    if args.force {
        pipeline_cfg.overwrite = OverwritePolicy::Replace;
    }

    let model = Arc::new(WorkerModel::spawn(&worker)?);
    let result = Pipeline::new(model.clone(), pipeline_cfg).run(&CommandConverter::new(converter));
    let report = settle(result, model.close())?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Combines the pipeline result with the worker shutdown result. A
/// pipeline failure wins; a shutdown failure after it is only logged.
fn settle<T>(
    result: giztoy_export::Result<T>,
    close: giztoy_export::Result<()>,
) -> giztoy_export::Result<T> {
    match (result, close) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "worker shutdown failed");
            Err(e)
        }
    }
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let artifact = ExportArtifact::load(&args.dir)?;
    println!("{}", serde_json::to_string_pretty(artifact.manifest())?);
    Ok(())
}
