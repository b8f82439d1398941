use anyhow::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const SUCCESS_PREFIX: &str = "success-model";
pub const MODEL_PREFIX: &str = "model";
pub const WEIGHTS_EXT: &str = "safetensors";

/// Path to a saved set of Q-network weights.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelHandle(pub PathBuf);

impl ModelHandle {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S%3f").to_string()
}

/// `success-model-<SYMBOL>-`; the trailing dash keeps `AAPL` from matching `AAPLX`.
pub fn success_prefix(symbol: &str) -> String {
    format!("{}-{}-", SUCCESS_PREFIX, symbol)
}

/// `model-<SYMBOL>-<stamp>.safetensors` under `dir`.
pub fn new_model_path(dir: &Path, symbol: &str) -> PathBuf {
    dir.join(format!("{}-{}-{}.{}", MODEL_PREFIX, symbol, stamp(), WEIGHTS_EXT))
}

/// Copies a trained model to a `success-model-<SYMBOL>-<stamp>` artifact next to it.
pub fn promote_to_success(dir: &Path, symbol: &str, trained: &ModelHandle) -> Result<ModelHandle> {
    let path = dir.join(format!("{}{}.{}", success_prefix(symbol), stamp(), WEIGHTS_EXT));
    std::fs::copy(trained.path(), &path)?;
    info!("Saved success checkpoint: {}", path.display());
    Ok(ModelHandle(path))
}

/// Newest `success-model-<SYMBOL>-*` entry in `dir`, if any.
///
/// Stamps sort lexicographically, so the greatest name is the latest artifact.
pub fn find_success_model(dir: &Path, symbol: &str) -> Result<Option<ModelHandle>> {
    if !dir.exists() {
        return Ok(None);
    }
    let prefix = success_prefix(symbol);
    let mut best: Option<(String, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        if best.as_ref().is_none_or(|(b, _)| name > *b) {
            best = Some((name, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| ModelHandle(path)))
}

/// Prefers an on-disk success artifact for `symbol` over the trainer's own handle.
pub fn resolve_model(dir: &Path, symbol: &str, trained: &ModelHandle) -> ModelHandle {
    match find_success_model(dir, symbol) {
        Ok(Some(found)) => {
            info!("Using success model {} for {}", found, symbol);
            found
        }
        Ok(None) => {
            info!("No success model for {}, using trained model {}", symbol, trained);
            trained.clone()
        }
        Err(e) => {
            warn!("Scanning {} for success models failed ({}); using trained model", dir.display(), e);
            trained.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    #[test]
    fn test_success_artifact_overrides_trained_handle() {
        let dir = tempfile::tempdir().unwrap();
        let trained = ModelHandle(touch(dir.path(), "model-AAPL-1.safetensors"));
        let success = touch(dir.path(), "success-model-AAPL-20240101.safetensors");

        assert_eq!(resolve_model(dir.path(), "AAPL", &trained), ModelHandle(success));
    }

    #[test]
    fn test_falls_back_to_trained_handle() {
        let dir = tempfile::tempdir().unwrap();
        let trained = ModelHandle(touch(dir.path(), "model-AAPL-1.safetensors"));
        touch(dir.path(), "success-model-MSFT-1.safetensors");
        touch(dir.path(), "success-model-AAPLX-1.safetensors");

        assert_eq!(resolve_model(dir.path(), "AAPL", &trained), trained);
        let missing = dir.path().join("nope");
        assert_eq!(resolve_model(&missing, "AAPL", &trained), trained);
    }

    #[test]
    fn test_newest_success_artifact_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "success-model-AAPL-20230101_000000000.safetensors");
        let newest = touch(dir.path(), "success-model-AAPL-20240101_000000000.safetensors");

        let found = find_success_model(dir.path(), "AAPL").unwrap();
        assert_eq!(found, Some(ModelHandle(newest)));
    }

    #[test]
    fn test_promote_copies_weights() {
        let dir = tempfile::tempdir().unwrap();
        let trained = ModelHandle(touch(dir.path(), "model-SPY-1.safetensors"));
        let promoted = promote_to_success(dir.path(), "SPY", &trained).unwrap();

        assert!(promoted.path().exists());
        let name = promoted.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("success-model-SPY-"));
        assert!(name.ends_with(".safetensors"));
    }
}
