//! Runs one worker per command file and collects their reports.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use saga::{CompensationConfig, CompensationEngine, DeliveryConfig, ExecutionContext};
use store::Store;
use tokio::task::JoinSet;

use crate::command::CommandReader;
use crate::error::{Result, WorkloadError};
use crate::worker::{Worker, WorkerReport};

/// Outcome of a whole run, one entry per command file in input order.
#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<Result<WorkerReport>>,
    /// Sessions the background reconciliation task completed, when one ran.
    pub compensation_sessions: Option<u64>,
}

impl RunSummary {
    pub fn reports(&self) -> impl Iterator<Item = &WorkerReport> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkloadError> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    /// True when every worker produced a report and read its stream to the end.
    pub fn is_clean(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r, Ok(report) if report.aborted.is_none()))
    }
}

/// Spawns a task per command file.
///
/// Workers share nothing but the store; a worker that fails to read its
/// file, aborts on a malformed record, or panics does not affect the others.
#[derive(Debug, Clone)]
pub struct Supervisor<S> {
    ctx: ExecutionContext<S>,
    delivery: DeliveryConfig,
    compensation: Option<CompensationConfig>,
    report_dir: Option<PathBuf>,
}

impl<S: Store + Clone + 'static> Supervisor<S> {
    pub fn new(ctx: ExecutionContext<S>) -> Self {
        Self {
            ctx,
            delivery: DeliveryConfig::default(),
            compensation: None,
            report_dir: None,
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = delivery;
        self
    }

    /// Runs the reconciliation task alongside the workers.
    pub fn with_compensation(mut self, config: CompensationConfig) -> Self {
        self.compensation = Some(config);
        self
    }

    /// Writes `worker-<n>.json` per finished worker into `dir`.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    #[tracing::instrument(skip(self, files), fields(workers = files.len()))]
    pub async fn run(&self, files: &[PathBuf]) -> RunSummary {
        if let Some(dir) = &self.report_dir {
            if let Err(source) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!(dir = %dir.display(), error = %source, "report directory unavailable");
            }
        }

        let compensation = self.compensation.map(|config| {
            saga::spawn(CompensationEngine::new(self.ctx.clone(), config))
        });

        let mut pending: BTreeMap<usize, PathBuf> = BTreeMap::new();
        let mut join_set = JoinSet::new();
        for (index, path) in files.iter().enumerate() {
            let worker_id = index + 1;
            pending.insert(worker_id, path.clone());

            let worker = Worker::new(worker_id, self.ctx.clone(), self.delivery);
            let path = path.clone();
            let report_dir = self.report_dir.clone();
            join_set.spawn(async move {
                let result = run_worker(&worker, &path, report_dir.as_deref()).await;
                (worker_id, result)
            });
        }

        let mut finished = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((worker_id, result)) => {
                    if let Err(err) = &result {
                        tracing::error!(worker = worker_id, error = %err, "worker failed");
                    }
                    pending.remove(&worker_id);
                    finished.insert(worker_id, result);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "worker task panicked");
                }
            }
        }
        for (worker, path) in pending {
            finished.insert(worker, Err(WorkloadError::WorkerLost { worker, path }));
        }

        let compensation_sessions = match compensation {
            Some(handle) => match handle.shutdown().await {
                Ok(sessions) => Some(sessions),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "reconciliation task panicked");
                    None
                }
            },
            None => None,
        };

        RunSummary {
            results: finished.into_values().collect(),
            compensation_sessions,
        }
    }
}

async fn run_worker<S: Store + Clone>(
    worker: &Worker<S>,
    path: &Path,
    report_dir: Option<&Path>,
) -> Result<WorkerReport> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| WorkloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let commands = CommandReader::new(Cursor::new(bytes));
    let report = worker.run(&path.display().to_string(), commands).await;

    if let Some(dir) = report_dir {
        let target = dir.join(format!("worker-{}.json", worker.id()));
        let json = serde_json::to_vec_pretty(&report)?;
        tokio::fs::write(&target, json)
            .await
            .map_err(|source| WorkloadError::Io {
                path: target.clone(),
                source,
            })?;
        tracing::debug!(path = %target.display(), "worker report written");
    }
    Ok(report)
}
