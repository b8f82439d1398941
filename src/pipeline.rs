use crate::config::{get_device, model_dir};
use crate::data::StockData;
use crate::environment::StockEnv;
use crate::model_artifacts::{self, ModelHandle};
use crate::runner::{self, RunLog, TestOutcome, TrainOutcome};
use crate::worker::WorkerEvent;
use anyhow::Result;
use async_trait::async_trait;
use candle_core::Device;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The collaborators one train+test cycle is delegated to.
///
/// Every synchronous method may be called from a blocking thread.
#[async_trait]
pub trait TradingPipeline: Send + Sync {
    /// Historical rows for `symbol`, oldest first.
    async fn fetch(&self, symbol: &str) -> Result<StockData>;

    /// Chronological train/test partition.
    fn split(&self, data: &StockData, split_ratio: f64) -> Result<(StockData, StockData)> {
        Ok(data.split(split_ratio))
    }

    fn build_env(&self, data: &StockData) -> Result<StockEnv> {
        StockEnv::new(data)
    }

    fn train(
        &self,
        symbol: &str,
        env: &mut StockEnv,
        epochs: usize,
        progress: Option<&mpsc::Sender<WorkerEvent>>,
    ) -> Result<TrainOutcome>;

    /// The model the tester should use: a saved success artifact if one
    /// exists for `symbol`, else the trainer's own handle.
    fn resolve_model(&self, symbol: &str, outcome: &TrainOutcome) -> ModelHandle;

    fn test(&self, env: &mut StockEnv, handle: &ModelHandle) -> Result<TestOutcome>;

    fn record_run(&self, _run_log: &RunLog) {}
}

/// Where `DqnPipeline` gets its history from.
#[derive(Clone, Debug)]
pub enum DataSource {
    Yahoo,
    /// Seeded random walk, for offline runs.
    Synthetic { days: usize, seed: u64 },
}

pub struct DqnPipeline {
    source: DataSource,
    device: Device,
    model_dir: PathBuf,
    persist_logs: bool,
}

impl DqnPipeline {
    pub fn new(source: DataSource, use_cuda: bool) -> Self {
        Self {
            source,
            device: get_device(use_cuda),
            model_dir: model_dir(),
            persist_logs: true,
        }
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn without_run_logs(mut self) -> Self {
        self.persist_logs = false;
        self
    }
}

#[async_trait]
impl TradingPipeline for DqnPipeline {
    async fn fetch(&self, symbol: &str) -> Result<StockData> {
        match &self.source {
            DataSource::Yahoo => StockData::fetch(symbol).await,
            DataSource::Synthetic { days, seed } => {
                info!("Generating {} synthetic rows for {}", days, symbol);
                Ok(StockData::new_mock(symbol, *days, *seed))
            }
        }
    }

    fn train(
        &self,
        symbol: &str,
        env: &mut StockEnv,
        epochs: usize,
        progress: Option<&mpsc::Sender<WorkerEvent>>,
    ) -> Result<TrainOutcome> {
        runner::trainer(symbol, env, epochs, &self.model_dir, &self.device, progress)
    }

    fn resolve_model(&self, symbol: &str, outcome: &TrainOutcome) -> ModelHandle {
        model_artifacts::resolve_model(&self.model_dir, symbol, &outcome.handle)
    }

    fn test(&self, env: &mut StockEnv, handle: &ModelHandle) -> Result<TestOutcome> {
        runner::tester(env, handle, &self.device)
    }

    fn record_run(&self, run_log: &RunLog) {
        if !self.persist_logs {
            return;
        }
        match runner::persist_run_log(run_log) {
            Ok(path) => info!("Run log written to {}", path.display()),
            Err(e) => warn!("Failed to write run log: {}", e),
        }
    }
}
