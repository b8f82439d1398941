use crate::agent::{DqnAgent, Transition};
use crate::config::{INITIAL_CAPITAL, LOG_DIR};
use crate::environment::{StockEnv, TradeAction};
use crate::model_artifacts::{self, ModelHandle};
use crate::worker::WorkerEvent;
use anyhow::Result;
use candle_core::Device;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize)]
pub struct EpisodeSummary {
    pub episode: usize,
    pub total_reward: f64,
    pub fortune: f64,
    pub mean_loss: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct TrainOutcome {
    /// Weights saved at the end of training.
    pub handle: ModelHandle,
    /// The final episode finished above the starting capital.
    pub succeeded: bool,
    pub final_fortune: f64,
    pub episodes: Vec<EpisodeSummary>,
}

/// Per-step greedy replay of a trained model; all sequences have one entry per decision.
#[derive(Clone, Debug, Default)]
pub struct TestOutcome {
    pub fortune: Vec<f64>,
    pub actions: Vec<TradeAction>,
    pub reward: Vec<f64>,
    pub cash: Vec<f64>,
}

fn emit(progress: Option<&mpsc::Sender<WorkerEvent>>, event: WorkerEvent) {
    if let Some(tx) = progress {
        // Progress is best effort; a slow UI must not stall training.
        let _ = tx.try_send(event);
    }
}

/// Trains a fresh agent for `epochs` full passes over `env` and saves its weights
/// under `model_dir`. A profitable final episode is also saved as a success artifact.
pub fn trainer(
    symbol: &str,
    env: &mut StockEnv,
    epochs: usize,
    model_dir: &Path,
    device: &Device,
    progress: Option<&mpsc::Sender<WorkerEvent>>,
) -> Result<TrainOutcome> {
    let started = Instant::now();
    let mut agent = DqnAgent::new(device)?;
    let mut episodes = Vec::with_capacity(epochs);

    info!(
        "Training {} for {} episodes of {} steps",
        symbol,
        epochs,
        env.num_steps()
    );

    for episode in 1..=epochs {
        let mut state = env.reset();
        let mut total_reward = 0.0;
        let mut loss_sum = 0.0;
        let mut loss_count = 0usize;

        let fortune = loop {
            let action = agent.act(&state, true)?;
            let step = env.step(action);
            agent.remember(Transition {
                state: std::mem::take(&mut state),
                action,
                reward: step.reward as f32,
                next_state: step.next_state.clone(),
                done: step.done,
            });
            if let Some(loss) = agent.learn()? {
                loss_sum += loss as f64;
                loss_count += 1;
            }

            total_reward += step.reward;
            if step.done {
                break step.fortune;
            }
            state = step.next_state;
        };
        agent.decay_epsilon();

        let mean_loss = (loss_count > 0).then(|| loss_sum / loss_count as f64);
        info!(
            "Episode {}/{}: total reward {:.4}, fortune {:.2}, epsilon {:.3}",
            episode,
            epochs,
            total_reward,
            fortune,
            agent.epsilon()
        );
        emit(
            progress,
            WorkerEvent::Episode {
                episode,
                epochs,
                total_reward,
                fortune,
            },
        );
        episodes.push(EpisodeSummary {
            episode,
            total_reward,
            fortune,
            mean_loss,
        });
    }

    std::fs::create_dir_all(model_dir)?;
    let handle = ModelHandle(model_artifacts::new_model_path(model_dir, symbol));
    agent.save(handle.path())?;
    info!("Saved model checkpoint: {}", handle);

    let final_fortune = episodes.last().map_or(INITIAL_CAPITAL, |e| e.fortune);
    let succeeded = final_fortune > INITIAL_CAPITAL;
    if succeeded {
        model_artifacts::promote_to_success(model_dir, symbol, &handle)?;
    } else {
        warn!(
            "Final training fortune {:.2} did not beat the starting capital; no success model saved",
            final_fortune
        );
    }

    info!("Training finished in {:.1}s", started.elapsed().as_secs_f64());
    emit(
        progress,
        WorkerEvent::Log(format!("Model saved: {}", handle)),
    );

    Ok(TrainOutcome {
        handle,
        succeeded,
        final_fortune,
        episodes,
    })
}

/// Replays `env` greedily with the weights behind `handle`.
pub fn tester(env: &mut StockEnv, handle: &ModelHandle, device: &Device) -> Result<TestOutcome> {
    let mut agent = DqnAgent::from_weights(handle.path(), device)?;
    let mut outcome = TestOutcome::default();
    let mut state = env.reset();

    loop {
        let action = agent.act(&state, false)?;
        let step = env.step(action);
        outcome.actions.push(step.executed);
        outcome.fortune.push(step.fortune);
        outcome.reward.push(step.reward);
        outcome.cash.push(step.cash);
        state = step.next_state;
        if step.done {
            break;
        }
    }

    info!(
        "Test replay with {}: {} steps, final fortune {:.2}",
        handle,
        outcome.actions.len(),
        outcome.fortune.last().copied().unwrap_or(INITIAL_CAPITAL)
    );
    Ok(outcome)
}

#[derive(Serialize)]
pub struct RunLog {
    pub symbol: String,
    pub split_ratio: f64,
    pub epochs: usize,
    pub started_at: String,
    pub finished_at: String,
    pub model: String,
    pub training_succeeded: bool,
    pub training_final_fortune: f64,
    pub episodes: Vec<EpisodeSummary>,
    pub test_steps: usize,
    pub final_fortune: f64,
    pub final_cash: f64,
}

pub fn persist_run_log(run_log: &RunLog) -> Result<PathBuf> {
    persist_run_log_in(Path::new(LOG_DIR), run_log)
}

/// Writes `run_<stamp>_<pid>.json` under `log_dir`.
fn persist_run_log_in(log_dir: &Path, run_log: &RunLog) -> Result<PathBuf> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_name = format!(
        "run_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S%3f"),
        std::process::id()
    );
    let file_path = log_dir.join(file_name);

    let file = std::fs::File::create(&file_path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, run_log)?;

    Ok(file_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StockData;

    #[test]
    fn test_train_then_test_produces_aligned_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let data = StockData::new_mock("TEST", 120, 11);
        let (train, test) = data.split(0.8);
        let mut env_train = StockEnv::new(&train).unwrap();
        let mut env_test = StockEnv::new(&test).unwrap();

        let outcome = trainer("TEST", &mut env_train, 2, dir.path(), &Device::Cpu, None).unwrap();
        assert_eq!(outcome.episodes.len(), 2);
        assert!(outcome.handle.path().exists());
        assert_eq!(
            outcome.succeeded,
            model_artifacts::find_success_model(dir.path(), "TEST").unwrap().is_some()
        );

        let result = tester(&mut env_test, &outcome.handle, &Device::Cpu).unwrap();
        let n = env_test.num_steps();
        assert_eq!(result.actions.len(), n);
        assert_eq!(result.fortune.len(), n);
        assert_eq!(result.reward.len(), n);
        assert_eq!(result.cash.len(), n);
        assert!(result.fortune.iter().all(|f| f.is_finite() && *f >= 0.0));
        assert!(result.cash.iter().all(|c| c.is_finite() && *c >= 0.0));
    }

    #[test]
    fn test_trainer_reports_each_episode() {
        let dir = tempfile::tempdir().unwrap();
        let data = StockData::new_mock("TEST", 40, 5);
        let mut env = StockEnv::new(&data).unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        trainer("TEST", &mut env, 3, dir.path(), &Device::Cpu, Some(&tx)).unwrap();

        let mut episodes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::Episode { episode, epochs, .. } = event {
                assert_eq!(epochs, 3);
                episodes.push(episode);
            }
        }
        assert_eq!(episodes, vec![1, 2, 3]);
    }

    #[test]
    fn test_run_log_file_name_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let run_log = RunLog {
            symbol: "AAPL".to_string(),
            split_ratio: 0.8,
            epochs: 5,
            started_at: "2024-01-01T00:00:00+00:00".to_string(),
            finished_at: "2024-01-01T00:01:00+00:00".to_string(),
            model: "models/model-AAPL-1.safetensors".to_string(),
            training_succeeded: true,
            training_final_fortune: 10_500.0,
            episodes: Vec::new(),
            test_steps: 15,
            final_fortune: 10_100.0,
            final_cash: 0.0,
        };

        let path = persist_run_log_in(&log_dir, &run_log).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("run_"));
        assert!(name.ends_with(&format!("_{}.json", std::process::id())));
        assert!(!name.contains("AAPL"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["training_final_fortune"], 10_500.0);
    }

    #[test]
    fn test_tester_rejects_missing_weights() {
        let data = StockData::new_mock("TEST", 20, 5);
        let mut env = StockEnv::new(&data).unwrap();
        let missing = ModelHandle(PathBuf::from("does-not-exist.safetensors"));
        assert!(tester(&mut env, &missing, &Device::Cpu).is_err());
    }
}
