//! `flashdiff` CLI - Retouch ambient/flash pairs with a diffusion denoiser.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flashdiff::schedule::{SkipKind, SkipPolicy};
use flashdiff::{Config, DiffusionSchedule, Pipeline, ScheduleKind};

/// Retouch ambient/flash exposure pairs using conditional diffusion.
#[derive(Parser, Debug)]
#[command(name = "flashdiff")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file. Command line flags override its values.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a retouched image from an ambient/flash pair.
    Sample(SampleArgs),
    /// Print a summary of the noise schedule.
    Schedule(ScheduleArgs),
}

#[derive(Args, Debug)]
struct SampleArgs {
    /// ONNX denoiser model.
    #[arg(short, long, value_name = "FILE")]
    model: PathBuf,

    /// Ambient exposure path.
    #[arg(value_name = "AMBIENT")]
    ambient: PathBuf,

    /// Flash exposure path.
    #[arg(value_name = "FLASH")]
    flash: PathBuf,

    /// Output image path.
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Optional highlight/window mask.
    #[arg(long, value_name = "FILE")]
    mask: Option<PathBuf>,

    /// Number of reverse steps. Fewer steps than the schedule length skip steps.
    #[arg(long, value_name = "INT")]
    steps: Option<usize>,

    /// Tile edge length in pixels.
    #[arg(long, value_name = "INT")]
    tile_size: Option<usize>,

    /// Overlap between neighbouring tiles in pixels.
    #[arg(long, value_name = "INT")]
    overlap: Option<usize>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, value_name = "INT")]
    quality: Option<u8>,

    /// Random seed for reproducibility.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Hide the progress bar.
    #[arg(long)]
    quiet: bool,
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    /// Schedule kind (linear or cosine).
    #[arg(long, value_name = "KIND")]
    kind: Option<ScheduleKind>,

    /// Number of diffusion steps.
    #[arg(long, value_name = "INT")]
    num_steps: Option<usize>,

    /// Also show the steps an accelerated sampler would visit.
    #[arg(long, value_name = "INT")]
    sampling_steps: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flashdiff={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?,
        None => Config::default(),
    };

    match &cli.command {
        Command::Sample(args) => sample(config, args),
        Command::Schedule(args) => schedule(config, args),
    }
}

fn sample(mut config: Config, args: &SampleArgs) -> Result<()> {
    for (path, what) in [(&args.ambient, "Ambient"), (&args.flash, "Flash")] {
        if !path.exists() {
            anyhow::bail!("{what} image does not exist: {}", path.display());
        }
    }

    if args.steps.is_some() {
        config.sampling.sampling_steps = args.steps;
    }
    if let Some(tile_size) = args.tile_size {
        config.tiling.tile_size = tile_size;
    }
    if let Some(overlap) = args.overlap {
        config.tiling.overlap = overlap;
    }
    if let Some(quality) = args.quality {
        config.output_quality = quality;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.sampling.show_progress = !args.quiet;

    let pipeline =
        Pipeline::from_onnx(config, &args.model).context("Failed to initialize pipeline")?;

    pipeline
        .process(
            &args.ambient,
            &args.flash,
            args.mask.as_ref(),
            &args.output,
        )
        .context("Failed to process image pair")?;

    println!(
        "Successfully retouched {} + {} -> {}",
        args.ambient.display(),
        args.flash.display(),
        args.output.display()
    );

    Ok(())
}

fn schedule(mut config: Config, args: &ScheduleArgs) -> Result<()> {
    if let Some(kind) = args.kind {
        config.schedule.kind = kind;
    }
    if let Some(num_steps) = args.num_steps {
        config.schedule.num_steps = num_steps;
    }

    let schedule =
        DiffusionSchedule::new(&config.schedule).context("Failed to build schedule")?;
    let steps = schedule.num_steps();

    println!("kind:        {}", config.schedule.kind);
    println!("steps:       {steps}");
    println!("beta_1:      {:.6e}", schedule.beta(1));
    println!("beta_T:      {:.6e}", schedule.beta(steps));
    println!("gamma_T:     {:.6e}", schedule.gamma(steps));
    println!("fingerprint: {:#018x}", schedule.fingerprint());

    if let Some(sampling_steps) = args.sampling_steps {
        let skip = config.sampling.skip;
        let respaced = schedule
            .respace(&skip, sampling_steps)
            .context("Failed to respace schedule")?;
        let visited = skip.select(steps, sampling_steps);

        println!();
        println!("{sampling_steps} {skip:?} steps: {visited:?}");
        println!("respaced gamma_T: {:.6e}", respaced.gamma(respaced.num_steps()));
    }

    Ok(())
}
