use std::env;
use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;
use tracing::{error, info};

use crate::domain::MatrixSource;
use crate::error::PrepError;
use crate::preparer::MatrixPreparer;
use crate::provider::MatrixProvider;

/// Downstream summarization stage. Receives the final normalized and
/// partitioned descriptors and owns everything statistical.
pub trait MatrixConsumer {
    fn consume(&mut self, sources: &[MatrixSource]) -> Result<(), PrepError>;
}

/// Consumer that only logs the handoff. Stands in when no summarization
/// stage is wired up.
pub struct LogConsumer;

impl MatrixConsumer for LogConsumer {
    fn consume(&mut self, sources: &[MatrixSource]) -> Result<(), PrepError> {
        for source in sources {
            info!(
                project = %source.project_id,
                path = %source.working_path,
                labels = ?source.labels,
                "prepared matrix ready for summarization"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub keep_fraction: Option<f64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Fetch, prepare, and hand off every matrix the provider yields.
///
/// Each matrix is processed inside its own fresh scratch directory, one at a
/// time. Any single matrix's failure is logged and the loop advances; only
/// errors raised before the loop starts abort the run.
pub fn run(
    provider: &MatrixProvider,
    consumer: &mut dyn MatrixConsumer,
    options: &RunOptions,
) -> Result<RunSummary, PrepError> {
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut iter = provider.matrices()?;
    let mut summary = RunSummary::default();
    loop {
        let _scratch = ScratchDir::enter()?;
        let Some(fetched) = iter.next() else {
            break;
        };
        let info = match fetched {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "matrix fetch failed");
                summary.failed += 1;
                continue;
            }
        };
        info!(project = %info.project_id, source = %info.kind, "processing matrix");

        let prepared = match prepare_one(info, options, &mut rng) {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(%err, "matrix preparation failed");
                summary.failed += 1;
                continue;
            }
        };

        if let Err(err) = consumer.consume(&prepared) {
            error!(%err, "downstream consumer failed");
            summary.failed += 1;
            continue;
        }
        summary.processed += 1;
    }
    info!(
        processed = summary.processed,
        failed = summary.failed,
        "finished"
    );
    Ok(summary)
}

fn prepare_one(
    info: MatrixSource,
    options: &RunOptions,
    rng: &mut StdRng,
) -> Result<Vec<MatrixSource>, PrepError> {
    let nested = MatrixPreparer::new(info).unpack(false)?;
    let mut prepared = Vec::new();
    for info in nested {
        let preparer = MatrixPreparer::new(info);
        preparer.normalize()?;
        if let Some(fraction) = options.keep_fraction {
            preparer.downsample(fraction, rng)?;
        }
        prepared.extend(preparer.partition()?);
    }
    Ok(prepared)
}

/// Fresh temporary working directory, entered on creation and left (and
/// deleted) on drop. Crash recovery relies on each run using a fresh
/// scratch directory rather than on any rollback of partial state.
struct ScratchDir {
    previous: PathBuf,
    _dir: TempDir,
}

impl ScratchDir {
    fn enter() -> Result<Self, PrepError> {
        let previous =
            env::current_dir().map_err(|err| PrepError::Filesystem(err.to_string()))?;
        let dir = tempfile::tempdir().map_err(|err| PrepError::Filesystem(err.to_string()))?;
        env::set_current_dir(dir.path())
            .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        Ok(Self {
            previous,
            _dir: dir,
        })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        // restore before the TempDir removes itself out from under cwd
        let _ = env::set_current_dir(&self.previous);
    }
}
