use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use matrix_prep::config::{ConfigLoader, ResolvedConfig};
use matrix_prep::object_store::{NullObjectStore, ObjectStore};
use matrix_prep::pipeline::{self, LogConsumer, RunOptions};
use matrix_prep::provider::provider_for;
use matrix_prep::service::{MatrixHttpService, MatrixService};

#[derive(Parser)]
#[command(name = "matrix-prep")]
#[command(about = "Fetch, normalize, and partition sparse expression matrices")]
#[command(version, author)]
struct Cli {
    /// Path to the JSON config file (default: matrix-prep.json in cwd)
    #[arg(long)]
    config: Option<String>,

    /// Override the configured matrix source (canned, fresh, local)
    #[arg(long)]
    source: Option<String>,

    /// Reprocess matrices even when their downstream artifacts are current
    #[arg(long)]
    force: bool,

    /// Randomly downsample each matrix to this fraction of its entries
    #[arg(long)]
    keep_fraction: Option<f64>,

    /// Seed for the downsampling RNG, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config: ResolvedConfig = ConfigLoader::resolve(cli.config.as_deref())
        .into_diagnostic()?;
    if let Some(source) = &cli.source {
        config.source = source.parse().into_diagnostic()?;
    }
    if cli.force {
        config.force = true;
    }
    let keep_fraction = cli.keep_fraction.or(config.keep_fraction);

    info!(
        source = %config.source,
        "preparing matrices for summarization"
    );

    let store: Arc<dyn ObjectStore> = Arc::new(NullObjectStore);
    let service: Arc<dyn MatrixService> = Arc::new(
        MatrixHttpService::new(config.service_url.clone(), config.catalog_url.clone())
            .into_diagnostic()?,
    );

    let provider = provider_for(config.source, &config, store, service).into_diagnostic()?;
    let options = RunOptions {
        keep_fraction,
        seed: cli.seed,
    };
    let summary = pipeline::run(&provider, &mut LogConsumer, &options).into_diagnostic()?;

    Ok(if summary.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
