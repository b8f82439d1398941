use crate::worker::RunError;
use candle_core::Device;
use tracing::{info, warn};

pub const WINDOW_TITLE: &str = "DQN Trader";
pub const WINDOW_WIDTH: f32 = 640.0;
pub const WINDOW_HEIGHT: f32 = 400.0;

// ── Input dialogs ───────────────────────────────────────────────────────────
/// Exclusive lower bound of the split ratio dialog.
pub const SPLIT_RATIO_MIN: f64 = 0.1;
pub const SPLIT_RATIO_MAX: f64 = 1.0;
pub const SPLIT_RATIO_STEP: f64 = 0.1;
pub const SPLIT_RATIO_DEFAULT: f64 = 0.7;
pub const EPOCHS_MIN: usize = 1;
pub const EPOCHS_MAX: usize = 100;
pub const EPOCHS_DEFAULT: usize = 5;

// ── Data ────────────────────────────────────────────────────────────────────
/// Range requested from the chart API before truncation.
pub const DATA_RANGE: &str = "5y";
/// Only the most recent observations are kept.
pub const MAX_OBSERVATIONS: usize = 500;
pub const CACHE_DIR: &str = ".cache";
pub const CACHE_MAX_AGE_SECS: u64 = 86_400;

// ── Environment ─────────────────────────────────────────────────────────────
/// Number of past closes the agent sees; the first LOOKBACK rows of each
/// partition are context only and produce no decision.
pub const LOOKBACK: usize = 5;
pub const INITIAL_CAPITAL: f64 = 10_000.0;
pub const TRADING_COST: f64 = 0.001;

// ── DQN ─────────────────────────────────────────────────────────────────────
pub const HIDDEN_DIM: usize = 64;
pub const LEARNING_RATE: f64 = 1e-3;
pub const GAMMA: f64 = 0.95;
pub const EPSILON_START: f64 = 1.0;
pub const EPSILON_END: f64 = 0.05;
pub const EPSILON_DECAY: f64 = 0.9;
pub const REPLAY_CAPACITY: usize = 5_000;
pub const BATCH_SIZE: usize = 32;
pub const TARGET_SYNC_STEPS: usize = 50;

pub const MODEL_DIR_ENV: &str = "DQN_TRADER_MODEL_DIR";
pub const DEFAULT_MODEL_DIR: &str = "models";
pub const LOG_DIR: &str = "log";

/// What the input dialogs have collected so far. Each field is written by
/// its dialog (last write wins) and read once when a run starts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDraft {
    pub symbol: Option<String>,
    pub split_ratio: Option<f64>,
    pub epochs: Option<usize>,
}

impl ConfigDraft {
    /// Stores a symbol. Blank input leaves the draft untouched and returns `None`.
    pub fn set_symbol(&mut self, raw: &str) -> Option<&str> {
        let symbol = raw.trim().to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        self.symbol = Some(symbol);
        self.symbol.as_deref()
    }

    pub fn set_split_ratio(&mut self, raw: f64) -> Result<f64, RunError> {
        let ratio = validate_split_ratio(raw)?;
        self.split_ratio = Some(ratio);
        Ok(ratio)
    }

    pub fn set_epochs(&mut self, raw: usize) -> Result<usize, RunError> {
        let epochs = validate_epochs(raw)?;
        self.epochs = Some(epochs);
        Ok(epochs)
    }

    /// Snapshots the draft into an immutable run configuration.
    pub fn to_run_config(&self) -> Result<RunConfig, RunError> {
        let symbol = self.symbol.clone().ok_or(RunError::MissingSymbol)?;
        RunConfig::new(
            &symbol,
            self.split_ratio.unwrap_or(SPLIT_RATIO_DEFAULT),
            self.epochs.unwrap_or(EPOCHS_DEFAULT),
        )
    }
}

/// Validated parameters of one training run, moved into the worker.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub symbol: String,
    pub split_ratio: f64,
    pub epochs: usize,
}

impl RunConfig {
    pub fn new(symbol: &str, split_ratio: f64, epochs: usize) -> Result<Self, RunError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(RunError::MissingSymbol);
        }
        Ok(Self {
            symbol,
            split_ratio: validate_split_ratio(split_ratio)?,
            epochs: validate_epochs(epochs)?,
        })
    }
}

/// Rounds to the dialog's one-decimal step and checks (0.1, 1.0].
pub fn validate_split_ratio(raw: f64) -> Result<f64, RunError> {
    if !(raw > SPLIT_RATIO_MIN && raw <= SPLIT_RATIO_MAX) {
        return Err(RunError::InvalidSplitRatio(raw));
    }
    // Compare on whole tenths so values that round down to 0.1 are rejected too.
    let tenths = (raw / SPLIT_RATIO_STEP).round() as i64;
    if tenths <= 1 || tenths > 10 {
        return Err(RunError::InvalidSplitRatio(raw));
    }
    Ok(tenths as f64 / 10.0)
}

pub fn validate_epochs(raw: usize) -> Result<usize, RunError> {
    if (EPOCHS_MIN..=EPOCHS_MAX).contains(&raw) {
        Ok(raw)
    } else {
        Err(RunError::InvalidEpochs(raw))
    }
}

pub fn model_dir() -> std::path::PathBuf {
    match std::env::var(MODEL_DIR_ENV) {
        Ok(path) if !path.trim().is_empty() => std::path::PathBuf::from(path.trim()),
        _ => std::path::PathBuf::from(DEFAULT_MODEL_DIR),
    }
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    info!("Using CPU device ({} threads available)", num_cpus::get());
    Device::Cpu
}
