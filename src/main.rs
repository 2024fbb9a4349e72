use std::path::PathBuf;

use ae_search::{AutoencoderSession, RunConfig};
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(feature = "wgpu")]
type Backend = Autodiff<burn::backend::Wgpu>;
#[cfg(not(feature = "wgpu"))]
type Backend = Autodiff<burn::backend::NdArray>;

#[derive(Parser)]
#[command(name = "ae-search")]
#[command(version)]
#[command(about = "Convolutional autoencoder training with pruned hyperparameter search")]
struct Cli {
    /// JSON run configuration; every field is optional.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample, train and prune autoencoder configurations.
    Search {
        /// Overrides `num_trials` from the config.
        #[arg(short, long)]
        trials: Option<usize>,
    },
    /// Retrain the replay configuration and plot sample reconstructions.
    Replay,
    /// Reload a saved model and plot one record's reconstruction.
    Reconstruct {
        /// Artifact path, with or without extension.
        #[arg(short, long)]
        artifact: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        record: usize,
        #[arg(long, default_value_t = 0)]
        channel: usize,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("failed to read config {}", path.display())),
        None => Ok(RunConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;
    let device = Default::default();
    let session = AutoencoderSession::<Backend>::new(config, device);
    let source = session.open_dataset()?;

    match cli.command {
        Commands::Search { trials } => {
            let trials = trials.unwrap_or(session.config().num_trials);
            session.search(&source, trials)?;
        }
        Commands::Replay => {
            let history = session.replay(&source)?;
            if let Some(last) = history.last() {
                info!(
                    "✅ Replay finished: val_loss_norm_error {:.5}",
                    last.val_loss_norm_error
                );
            }
        }
        Commands::Reconstruct {
            artifact,
            record,
            channel,
        } => {
            let report = session.reconstruct(&artifact, &source, record, channel)?;
            info!("✅ {}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}
