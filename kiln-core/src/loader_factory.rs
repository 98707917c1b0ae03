use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::flux::{FluxLoader, FluxVariant};
use crate::{read_token, DeviceMap, HubFetcher, Loader, ModelLike, ModelSource, ModelStore, TOKEN_ENV};

/// Enum of supported model types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Flux,
}

impl ModelType {
    /// Detect model type from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        if model_name.to_uppercase().contains("FLUX") {
            Some(ModelType::Flux)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("SCHNELL") {
                FluxVariant::Schnell
            } else if name_upper.contains("KREA") {
                FluxVariant::KreaDev
            } else if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                FluxVariant::Schnell // Default to Schnell if no specific variant is found
            }))
        } else {
            None
        }
    }
}

/// Load a model by name: read the registry token, make sure the volume holds
/// a complete copy, then place it on the GPU.
pub async fn load_model(
    model_name: &str,
    store: &ModelStore,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let token = read_token(TOKEN_ENV)?;

    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    info!(
        "Loading model: {} (detected type: {:?}/variant: {:?})",
        model_name, model_type, model_variant
    );

    match model_variant {
        ModelVariant::Flux(variant) => {
            let files = FluxLoader::required_files(model_name, variant);
            let fetcher = HubFetcher::new(token, store.models_dir().to_path_buf())?;
            let local = store.ensure_local(model_name, &files, &fetcher).await?;

            let model = tokio::task::spawn_blocking(move || {
                FluxLoader::load(variant, &local, device_map)
            })
            .await
            .context("model load task failed")??;
            Ok(Arc::new(model))
        }
    }
}

/// Loads the configured model from the hub through the volume cache.
#[derive(Debug, Clone)]
pub struct HubModelSource {
    pub model_name: String,
    pub store: ModelStore,
    pub device_map: DeviceMap,
}

#[async_trait]
impl ModelSource for HubModelSource {
    async fn load(&self) -> Result<Arc<dyn ModelLike>> {
        load_model(&self.model_name, &self.store, self.device_map).await
    }
}
