use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use crate::{DeviceMap, LocalFiles, ModelLike, RemoteFile};

/// Builds a model from a complete local copy of its files.
pub trait Loader {
    type Model: ModelLike;
    type Variant: Copy;

    /// Files that must be present locally before `load` can run.
    fn required_files(model_id: &str, variant: Self::Variant) -> Vec<RemoteFile>;

    /// Blocking: maps weights and places them on the device.
    fn load(variant: Self::Variant, files: &LocalFiles, device_map: DeviceMap) -> Result<Self::Model>
    where
        Self: Sized;
}

/// Produces the process model on first use.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn ModelLike>>;
}

/// Process-wide holder for the loaded model. Initialization runs at most once
/// at a time; a failed attempt leaves the holder empty for the next job.
pub struct ModelHandle {
    source: Box<dyn ModelSource>,
    model: OnceCell<Arc<dyn ModelLike>>,
}

impl ModelHandle {
    pub fn new(source: impl ModelSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            model: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<dyn ModelLike>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let start = std::time::Instant::now();
                let model = self.source.load().await?;
                info!("Model loaded in {:.1}s", start.elapsed().as_secs_f32());
                Ok::<_, anyhow::Error>(model)
            })
            .await?;
        Ok(model.clone())
    }
}
