use std::path::{Path, PathBuf};

use crate::Error;

pub const DEFAULT_VOLUME_PATH: &str = "/runpod-volume";
pub const DEFAULT_MODEL: &str = "black-forest-labs/FLUX.1-Krea-dev";
pub const TOKEN_ENV: &str = "HF_TOKEN";

/// Directory layout of the shared storage volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLayout {
    root: PathBuf,
}

impl VolumeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn hf_home(&self) -> PathBuf {
        self.root.join(".cache").join("huggingface")
    }

    pub fn transformers_cache(&self) -> PathBuf {
        self.root.join(".cache").join("transformers")
    }

    pub fn datasets_cache(&self) -> PathBuf {
        self.root.join(".cache").join("datasets")
    }

    /// Cache-directory variables that redirect library caches onto the volume.
    pub fn cache_env(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("HF_HOME", self.hf_home()),
            ("TRANSFORMERS_CACHE", self.transformers_cache()),
            ("HF_DATASETS_CACHE", self.datasets_cache()),
        ]
    }

    /// Must run before any other thread is spawned.
    pub fn export_cache_env(&self) {
        for (key, value) in self.cache_env() {
            std::env::set_var(key, value);
        }
    }
}

impl Default for VolumeLayout {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_PATH)
    }
}

/// Reads the registry token. Called when the model is loaded, so a missing
/// token fails that request instead of the process.
pub fn read_token(var: &'static str) -> Result<String, Error> {
    match std::env::var(var) {
        Ok(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(Error::MissingCredential(var)),
    }
}
