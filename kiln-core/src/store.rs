//! Persistent model cache on the shared volume.
//!
//! Every model lives in a flat directory under `models/` named after its
//! repository id. A directory only counts as a usable copy once its manifest
//! has been written, which happens after every file has been persisted.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{Error, VolumeLayout};

pub const MANIFEST_FILE: &str = "kiln-manifest.json";

/// Flat directory name for a model id, e.g.
/// `black-forest-labs/FLUX.1-Krea-dev` -> `black-forest-labs--FLUX.1-Krea-dev`.
pub fn local_dir_name(model_id: &str) -> String {
    model_id.replace(['/', '\\'], "--")
}

/// One file a model needs, and where it is kept inside the local model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub repo: String,
    pub revision: Option<String>,
    pub remote: String,
    pub local: String,
}

impl RemoteFile {
    pub fn new(repo: impl Into<String>, remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: None,
            remote: remote.into(),
            local: local.into(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub model_id: String,
    pub files: Vec<ManifestEntry>,
}

/// A complete local copy of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, local: &str) -> PathBuf {
        self.root.join(local)
    }
}

/// Source of model files for the cold path.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `file` and returns the path of the downloaded copy.
    async fn fetch(&self, file: &RemoteFile) -> Result<PathBuf, Error>;
}

/// Fetches from the Hugging Face hub, downloading into `cache_dir`.
pub struct HubFetcher {
    api: Api,
}

impl HubFetcher {
    pub fn new(token: String, cache_dir: PathBuf) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_token(Some(token))
            .with_cache_dir(cache_dir)
            .with_progress(false)
            .build()
            .context("failed to create hf hub API")?;
        Ok(Self { api })
    }
}

#[async_trait]
impl Fetcher for HubFetcher {
    async fn fetch(&self, file: &RemoteFile) -> Result<PathBuf, Error> {
        let repo = match &file.revision {
            Some(revision) => {
                Repo::with_revision(file.repo.clone(), RepoType::Model, revision.clone())
            }
            None => Repo::model(file.repo.clone()),
        };
        self.api
            .repo(repo)
            .get(&file.remote)
            .await
            .map_err(|source| Error::Fetch {
                repo: file.repo.clone(),
                file: file.remote.clone(),
                source: Box::new(source),
            })
    }
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn from_layout(layout: &VolumeLayout) -> Self {
        Self::new(layout.models_dir())
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn local_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(local_dir_name(model_id))
    }

    /// Whether `dir` holds a finished copy of `model_id` with every file in `files`.
    pub async fn is_complete(&self, dir: &Path, model_id: &str, files: &[RemoteFile]) -> bool {
        let Ok(manifest) = read_manifest(dir).await else {
            return false;
        };
        if manifest.model_id != model_id {
            return false;
        }
        for file in files {
            let Some(entry) = manifest.files.iter().find(|e| e.path == file.local) else {
                return false;
            };
            match fs::metadata(dir.join(&file.local)).await {
                Ok(meta) if meta.is_file() && meta.len() == entry.size => {}
                _ => return false,
            }
        }
        true
    }

    /// Returns a complete local copy of the model, fetching and persisting it
    /// first if the volume does not hold one yet.
    pub async fn ensure_local(
        &self,
        model_id: &str,
        files: &[RemoteFile],
        fetcher: &dyn Fetcher,
    ) -> Result<LocalFiles> {
        let dir = self.local_dir(model_id);

        if self.is_complete(&dir, model_id, files).await {
            info!("Loading model from volume: {}", dir.display());
            return Ok(LocalFiles { root: dir });
        }

        if dir_has_entries(&dir).await {
            warn!(
                "{} exists but has no valid manifest, treating it as a partial download",
                dir.display()
            );
        }
        info!("Downloading model to volume: {}", dir.display());

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        match fs::remove_file(dir.join(MANIFEST_FILE)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).context("failed to remove stale manifest");
            }
            _ => {}
        }

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            debug!("fetching {} from {}", file.remote, file.repo);
            let downloaded = fetcher.fetch(file).await?;
            let dest = dir.join(&file.local);
            persist(&downloaded, &dest)
                .await
                .with_context(|| format!("failed to persist {}", dest.display()))?;
            let size = fs::metadata(&dest).await?.len();
            entries.push(ManifestEntry {
                path: file.local.clone(),
                size,
            });
        }

        let manifest = Manifest {
            model_id: model_id.to_string(),
            files: entries,
        };
        write_manifest(&dir, &manifest).await?;

        if !self.is_complete(&dir, model_id, files).await {
            return Err(Error::IncompleteModel(dir).into());
        }
        Ok(LocalFiles { root: dir })
    }
}

async fn read_manifest(dir: &Path) -> Result<Manifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE)).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let dest = dir.join(MANIFEST_FILE);
    let partial = partial_path(&dest);
    fs::write(&partial, serde_json::to_vec_pretty(manifest)?).await?;
    fs::rename(&partial, &dest)
        .await
        .context("failed to write model manifest")?;
    Ok(())
}

async fn dir_has_entries(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Temp name next to `dest`, unique per process since workers may share the volume.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", std::process::id()));
    dest.with_file_name(name)
}

/// Places `src` at `dest`, hard-linking when both sit on the same filesystem.
async fn persist(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    // hub caches hand out symlinks into their blob store
    let src = fs::canonicalize(src).await?;
    let partial = partial_path(dest);
    let _ = fs::remove_file(&partial).await;
    if fs::hard_link(&src, &partial).await.is_err() {
        fs::copy(&src, &partial).await?;
    }
    fs::rename(&partial, dest).await?;
    // rename is a no-op when dest already links the same blob
    let _ = fs::remove_file(&partial).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DirFetcher {
        remote: PathBuf,
        calls: AtomicUsize,
        fail_on: Option<String>,
    }

    impl DirFetcher {
        fn new(remote: &Path) -> Self {
            Self {
                remote: remote.to_path_buf(),
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl Fetcher for DirFetcher {
        async fn fetch(&self, file: &RemoteFile) -> Result<PathBuf, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(file.remote.as_str()) {
                return Err(Error::Fetch {
                    repo: file.repo.clone(),
                    file: file.remote.clone(),
                    source: "connection reset".into(),
                });
            }
            Ok(self.remote.join(&file.remote))
        }
    }

    fn files() -> Vec<RemoteFile> {
        vec![
            RemoteFile::new("org/model", "ae.safetensors", "ae.safetensors"),
            RemoteFile::new("org/encoder", "model.safetensors", "t5/model.safetensors")
                .with_revision("refs/pr/2"),
        ]
    }

    fn seed_remote(dir: &Path) {
        std::fs::write(dir.join("ae.safetensors"), b"autoencoder weights").unwrap();
        std::fs::write(dir.join("model.safetensors"), b"encoder weights").unwrap();
    }

    #[test]
    fn dir_name_flattens_separators() {
        assert_eq!(
            local_dir_name("black-forest-labs/FLUX.1-Krea-dev"),
            "black-forest-labs--FLUX.1-Krea-dev"
        );
        assert_eq!(local_dir_name("a\\b/c"), "a--b--c");
        let store = ModelStore::new("/runpod-volume/models");
        assert_eq!(
            store.local_dir("org/model"),
            PathBuf::from("/runpod-volume/models/org--model")
        );
    }

    #[test]
    fn partial_names_are_per_process() {
        let partial = partial_path(Path::new("/v/models/org--model/ae.safetensors"));
        assert_eq!(
            partial,
            PathBuf::from(format!(
                "/v/models/org--model/ae.safetensors.{}.partial",
                std::process::id()
            ))
        );
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blob");
        std::fs::write(&src, b"weights").unwrap();
        let dest = dir.path().join("out").join("model.safetensors");

        persist(&src, &dest).await.unwrap();
        persist(&src, &dest).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"weights");
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cold_then_warm_yield_the_same_files() {
        let volume = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        seed_remote(remote.path());
        let store = ModelStore::new(volume.path().join("models"));
        let fetcher = DirFetcher::new(remote.path());

        let cold = store.ensure_local("org/model", &files(), &fetcher).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(cold.root().join(MANIFEST_FILE).is_file());

        let warm = store.ensure_local("org/model", &files(), &fetcher).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2, "warm path must not fetch");
        assert_eq!(cold, warm);
        assert_eq!(
            std::fs::read(warm.path("t5/model.safetensors")).unwrap(),
            b"encoder weights"
        );
    }

    #[tokio::test]
    async fn non_empty_dir_without_manifest_is_refetched() {
        let volume = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        seed_remote(remote.path());
        let store = ModelStore::new(volume.path());
        let dir = store.local_dir("org/model");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ae.safetensors"), b"trunc").unwrap();

        assert!(!store.is_complete(&dir, "org/model", &files()).await);

        let fetcher = DirFetcher::new(remote.path());
        let local = store.ensure_local("org/model", &files(), &fetcher).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read(local.path("ae.safetensors")).unwrap(),
            b"autoencoder weights"
        );
    }

    #[tokio::test]
    async fn size_mismatch_invalidates_the_copy() {
        let volume = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        seed_remote(remote.path());
        let store = ModelStore::new(volume.path());
        let fetcher = DirFetcher::new(remote.path());
        let local = store.ensure_local("org/model", &files(), &fetcher).await.unwrap();

        std::fs::write(local.path("ae.safetensors"), b"short").unwrap();
        assert!(!store.is_complete(local.root(), "org/model", &files()).await);
        assert!(!store.is_complete(local.root(), "org/other", &files()).await);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_manifest() {
        let volume = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        seed_remote(remote.path());
        let store = ModelStore::new(volume.path());
        let mut fetcher = DirFetcher::new(remote.path());
        fetcher.fail_on = Some("model.safetensors".to_string());

        let err = store
            .ensure_local("org/model", &files(), &fetcher)
            .await
            .unwrap_err();
        assert_eq!(crate::ErrorKind::of(&err), crate::ErrorKind::Resource);
        assert!(!store.local_dir("org/model").join(MANIFEST_FILE).exists());
    }
}
