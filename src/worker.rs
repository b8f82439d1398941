//! One train+test cycle off the UI thread, delivered exactly once over a
//! one-shot channel.

use crate::config::{LOOKBACK, RunConfig};
use crate::data::Candle;
use crate::environment::TradeAction;
use crate::pipeline::TradingPipeline;
use crate::runner::RunLog;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

const PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error("no symbol entered; use the Symbol input first")]
    MissingSymbol,
    #[error("split ratio {0} is outside (0.1, 1.0]")]
    InvalidSplitRatio(f64),
    #[error("epochs {0} is outside [1, 100]")]
    InvalidEpochs(usize),
    #[error("not enough data for {symbol}: {train_rows} train / {test_rows} test rows, need more than {lookback} each")]
    InsufficientData {
        symbol: String,
        train_rows: usize,
        test_rows: usize,
        lookback: usize,
    },
    #[error("{0}")]
    Collaborator(String),
    #[error("training worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("training worker stopped without a result")]
    WorkerVanished,
}

impl RunError {
    fn collaborator(e: anyhow::Error) -> Self {
        Self::Collaborator(format!("{:#}", e))
    }
}

/// Everything the window needs from a finished run. The four sequences are
/// parallel: one entry per test-set decision.
#[derive(Clone, Debug)]
pub struct ResultBundle {
    pub test_data: Vec<Candle>,
    pub actions: Vec<TradeAction>,
    pub fortune: Vec<f64>,
    pub cash: Vec<f64>,
}

impl ResultBundle {
    pub fn len(&self) -> usize {
        self.test_data.len()
    }

    pub fn final_fortune(&self) -> Option<f64> {
        self.fortune.last().copied()
    }

    pub fn final_cash(&self) -> Option<f64> {
        self.cash.last().copied()
    }
}

pub type RunResult = Result<ResultBundle, RunError>;

/// Progress streamed while a run is in flight.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    Episode {
        episode: usize,
        epochs: usize,
        total_reward: f64,
        fortune: f64,
    },
    Log(String),
}

/// Runs the full cycle: fetch, split, build environments, train, resolve the
/// model, test.
pub async fn run_cycle(
    config: RunConfig,
    pipeline: Arc<dyn TradingPipeline>,
    progress: Option<mpsc::Sender<WorkerEvent>>,
) -> RunResult {
    if config.symbol.trim().is_empty() {
        return Err(RunError::MissingSymbol);
    }
    let started_at = Utc::now();
    let say = |msg: String| {
        info!("{}", msg);
        if let Some(tx) = &progress {
            let _ = tx.try_send(WorkerEvent::Log(msg));
        }
    };

    say(format!("Fetching history for {}...", config.symbol));
    let data = pipeline
        .fetch(&config.symbol)
        .await
        .map_err(RunError::collaborator)?;

    let (train, test) = pipeline
        .split(&data, config.split_ratio)
        .map_err(RunError::collaborator)?;
    if train.len() <= LOOKBACK || test.len() <= LOOKBACK {
        return Err(RunError::InsufficientData {
            symbol: config.symbol.clone(),
            train_rows: train.len(),
            test_rows: test.len(),
            lookback: LOOKBACK,
        });
    }
    say(format!(
        "Data ready: {} train / {} test rows",
        train.len(),
        test.len()
    ));

    let blocking = tokio::task::spawn_blocking(move || -> RunResult {
        let mut env_train = pipeline.build_env(&train).map_err(RunError::collaborator)?;
        let mut env_test = pipeline.build_env(&test).map_err(RunError::collaborator)?;

        let outcome = pipeline
            .train(&config.symbol, &mut env_train, config.epochs, progress.as_ref())
            .map_err(RunError::collaborator)?;
        let handle = pipeline.resolve_model(&config.symbol, &outcome);
        info!("Model Name: {}", handle);

        let tested = pipeline
            .test(&mut env_test, &handle)
            .map_err(RunError::collaborator)?;

        let bundle = ResultBundle {
            test_data: env_test.decision_rows().to_vec(),
            actions: tested.actions,
            fortune: tested.fortune,
            cash: tested.cash,
        };
        let n = bundle.len();
        if bundle.actions.len() != n || bundle.fortune.len() != n || bundle.cash.len() != n {
            return Err(RunError::Collaborator(format!(
                "tester returned misaligned sequences: {} rows, {} actions, {} fortune, {} cash",
                n,
                bundle.actions.len(),
                bundle.fortune.len(),
                bundle.cash.len()
            )));
        }

        pipeline.record_run(&RunLog {
            symbol: config.symbol.clone(),
            split_ratio: config.split_ratio,
            epochs: config.epochs,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            model: handle.to_string(),
            training_succeeded: outcome.succeeded,
            training_final_fortune: outcome.final_fortune,
            episodes: outcome.episodes,
            test_steps: n,
            final_fortune: bundle.final_fortune().unwrap_or_default(),
            final_cash: bundle.final_cash().unwrap_or_default(),
        });

        Ok(bundle)
    });

    match blocking.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(RunError::WorkerPanicked(panic_message(e.into_panic()))),
        Err(_) => Err(RunError::WorkerVanished),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The UI's side of one in-flight run.
pub struct RunHandle {
    result_rx: oneshot::Receiver<RunResult>,
    progress_rx: mpsc::Receiver<WorkerEvent>,
}

impl RunHandle {
    /// Non-blocking. Yields the result once; a worker that went away without
    /// sending is reported as `WorkerVanished`.
    pub fn poll(&mut self) -> Option<RunResult> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RunError::WorkerVanished)),
        }
    }

    pub fn drain_progress(&mut self) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.progress_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Runtime the app spawns runs on. Shut it down with
/// `Runtime::shutdown_background` so training still on a blocking thread
/// does not keep the process alive after the window closes.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Spawns one run on the current tokio runtime.
pub fn spawn_run(config: RunConfig, pipeline: Arc<dyn TradingPipeline>) -> RunHandle {
    let (result_tx, result_rx) = oneshot::channel();
    let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CAPACITY);

    tokio::spawn(async move {
        let symbol = config.symbol.clone();
        let result = run_cycle(config, pipeline, Some(progress_tx)).await;
        match &result {
            Ok(bundle) => info!(
                "Run for {} completed: {} steps, final fortune {:?}",
                symbol,
                bundle.len(),
                bundle.final_fortune()
            ),
            Err(e) => error!("Run for {} failed: {}", symbol, e),
        }
        let _ = result_tx.send(result);
    });

    RunHandle {
        result_rx,
        progress_rx,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::StockData;
    use crate::environment::StockEnv;
    use crate::model_artifacts::{self, ModelHandle};
    use crate::pipeline::{DataSource, DqnPipeline};
    use crate::runner::{TestOutcome, TrainOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum Fault {
        None,
        Fetch,
        TrainPanic,
        ShortData,
        /// Training blocks its thread for several seconds.
        SlowTrain,
    }

    /// Deterministic collaborators: trains nothing, buys on the first test
    /// step and holds afterwards.
    pub(crate) struct MockPipeline {
        pub fault: Fault,
        pub model_dir: PathBuf,
        pub tested_with: Mutex<Vec<ModelHandle>>,
        pub delay: Duration,
    }

    impl MockPipeline {
        pub fn new(fault: Fault, model_dir: PathBuf) -> Self {
            Self {
                fault,
                model_dir,
                tested_with: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TradingPipeline for MockPipeline {
        async fn fetch(&self, symbol: &str) -> Result<StockData> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.fault {
                Fault::Fetch => anyhow::bail!("provider unavailable"),
                Fault::ShortData => Ok(StockData::new_mock(symbol, 8, 1)),
                _ => Ok(StockData::new_mock(symbol, 100, 1)),
            }
        }

        fn train(
            &self,
            _symbol: &str,
            _env: &mut StockEnv,
            epochs: usize,
            progress: Option<&mpsc::Sender<WorkerEvent>>,
        ) -> Result<TrainOutcome> {
            match self.fault {
                Fault::TrainPanic => panic!("diverged"),
                Fault::SlowTrain => std::thread::sleep(Duration::from_secs(4)),
                _ => {}
            }
            if let Some(tx) = progress {
                let _ = tx.try_send(WorkerEvent::Episode {
                    episode: epochs,
                    epochs,
                    total_reward: 0.0,
                    fortune: 10_000.0,
                });
            }
            Ok(TrainOutcome {
                handle: ModelHandle(self.model_dir.join("trained.safetensors")),
                succeeded: false,
                final_fortune: 10_000.0,
                episodes: Vec::new(),
            })
        }

        fn resolve_model(&self, symbol: &str, outcome: &TrainOutcome) -> ModelHandle {
            model_artifacts::resolve_model(&self.model_dir, symbol, &outcome.handle)
        }

        fn test(&self, env: &mut StockEnv, handle: &ModelHandle) -> Result<TestOutcome> {
            self.tested_with.lock().unwrap().push(handle.clone());
            let mut out = TestOutcome::default();
            env.reset();
            let mut first = true;
            loop {
                let action = if first { TradeAction::Buy } else { TradeAction::Hold };
                first = false;
                let step = env.step(action);
                out.actions.push(step.executed);
                out.fortune.push(step.fortune);
                out.reward.push(step.reward);
                out.cash.push(step.cash);
                if step.done {
                    break;
                }
            }
            Ok(out)
        }
    }

    fn config(symbol: &str) -> RunConfig {
        RunConfig::new(symbol, 0.8, 5).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_yields_aligned_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::None, dir.path().to_path_buf()));

        let bundle = run_cycle(config("AAPL"), pipeline, None).await.unwrap();
        assert_eq!(bundle.len(), 20 - LOOKBACK);
        assert_eq!(bundle.actions.len(), bundle.len());
        assert_eq!(bundle.fortune.len(), bundle.len());
        assert_eq!(bundle.cash.len(), bundle.len());
        assert_eq!(bundle.actions[0], TradeAction::Buy);

        let fortune = bundle.final_fortune().unwrap();
        let cash = bundle.final_cash().unwrap();
        assert_eq!(fortune, *bundle.fortune.last().unwrap());
        assert!(fortune.is_finite() && fortune >= 0.0);
        assert!(cash.is_finite() && cash >= 0.0);
    }

    #[tokio::test]
    async fn test_success_model_on_disk_is_used_for_testing() {
        let dir = tempfile::tempdir().unwrap();
        let success = dir.path().join("success-model-AAPL-20240101_000000000.safetensors");
        std::fs::write(&success, b"weights").unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::None, dir.path().to_path_buf()));

        run_cycle(config("AAPL"), pipeline.clone(), None).await.unwrap();
        assert_eq!(*pipeline.tested_with.lock().unwrap(), vec![ModelHandle(success)]);
    }

    #[tokio::test]
    async fn test_trained_handle_used_without_success_model() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::None, dir.path().to_path_buf()));

        run_cycle(config("AAPL"), pipeline.clone(), None).await.unwrap();
        assert_eq!(
            *pipeline.tested_with.lock().unwrap(),
            vec![ModelHandle(dir.path().join("trained.safetensors"))]
        );
    }

    #[tokio::test]
    async fn test_collaborator_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();

        let fetch = Arc::new(MockPipeline::new(Fault::Fetch, dir.path().to_path_buf()));
        let err = run_cycle(config("AAPL"), fetch, None).await.unwrap_err();
        assert_eq!(err, RunError::Collaborator("provider unavailable".to_string()));

        let short = Arc::new(MockPipeline::new(Fault::ShortData, dir.path().to_path_buf()));
        let err = run_cycle(config("AAPL"), short, None).await.unwrap_err();
        assert!(matches!(err, RunError::InsufficientData { train_rows: 6, test_rows: 2, .. }));

        let panicky = Arc::new(MockPipeline::new(Fault::TrainPanic, dir.path().to_path_buf()));
        let err = run_cycle(config("AAPL"), panicky, None).await.unwrap_err();
        assert_eq!(err, RunError::WorkerPanicked("diverged".to_string()));
    }

    #[tokio::test]
    async fn test_full_split_ratio_is_insufficient_data() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::None, dir.path().to_path_buf()));

        let config = RunConfig::new("AAPL", 1.0, 5).unwrap();
        let err = run_cycle(config, pipeline.clone(), None).await.unwrap_err();
        assert_eq!(
            err,
            RunError::InsufficientData {
                symbol: "AAPL".to_string(),
                train_rows: 100,
                test_rows: 0,
                lookback: LOOKBACK,
            }
        );
        assert!(pipeline.tested_with.lock().unwrap().is_empty());
    }

    #[test]
    fn test_runtime_shutdown_does_not_wait_for_training() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::SlowTrain, dir.path().to_path_buf()));
        let rt = build_runtime().unwrap();

        let mut handle = {
            let _guard = rt.enter();
            spawn_run(config("AAPL"), pipeline)
        };
        std::thread::sleep(Duration::from_millis(300));
        assert!(handle.poll().is_none(), "training should still be running");

        let started = std::time::Instant::now();
        rt.shutdown_background();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "shutdown waited {:?} for the blocking task",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_spawned_run_delivers_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(MockPipeline::new(Fault::None, dir.path().to_path_buf()));
        let mut handle = spawn_run(config("AAPL"), pipeline);

        let result = loop {
            if let Some(result) = handle.poll() {
                break result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(result.is_ok());
        // The sender is consumed; a second poll reports the closed channel.
        assert_eq!(handle.poll().map(|r| r.is_err()), Some(true));

        let events = handle.drain_progress();
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Episode { epochs: 5, .. })));
        assert!(events.iter().any(|e| matches!(e, WorkerEvent::Log(_))));
    }

    #[tokio::test]
    async fn test_dqn_pipeline_end_to_end_on_synthetic_data() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(
            DqnPipeline::new(DataSource::Synthetic { days: 80, seed: 9 }, false)
                .with_model_dir(dir.path())
                .without_run_logs(),
        );

        let bundle = run_cycle(RunConfig::new("SYN", 0.7, 2).unwrap(), pipeline, None)
            .await
            .unwrap();
        assert_eq!(bundle.len(), 24 - LOOKBACK);
        assert_eq!(bundle.actions.len(), bundle.len());
        assert_eq!(bundle.cash.len(), bundle.len());
        assert!(bundle.final_fortune().is_some_and(|f| f.is_finite() && f >= 0.0));
    }
}
