use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{self, ClipTextConfig, ClipTextTransformer},
    flux::{self, autoencoder::AutoEncoder, model::Flux},
    t5::{self, T5EncoderModel},
};
use image::DynamicImage;
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    select_gpu_device, tensor_to_image, DeviceMap, GenerationRequest, Loader, LocalFiles,
    ModelLike, RemoteFile,
};

const T5_REPO: &str = "google/t5-v1_1-xxl";
const T5_REVISION: &str = "refs/pr/2";
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const CLIP_REPO: &str = "openai/clip-vit-large-patch14";

const T5_WEIGHTS: &str = "t5/model.safetensors";
const T5_CONFIG: &str = "t5/config.json";
const T5_TOKENIZER: &str = "t5/tokenizer.json";
const CLIP_WEIGHTS: &str = "clip/model.safetensors";
const CLIP_TOKENIZER: &str = "clip/tokenizer.json";
const AUTOENCODER_WEIGHTS: &str = "ae.safetensors";

const T5_SEQUENCE_LEN: usize = 256;
const LATENT_ALIGN: usize = 16;
const CLIP_MAX_POSITIONS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FluxVariant {
    Schnell,
    Dev,
    KreaDev,
}

serde_plain::derive_display_from_serialize!(FluxVariant);

impl FluxVariant {
    /// Transformer weights at the root of the model repository.
    pub fn weights_file(&self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
            FluxVariant::KreaDev => "flux1-krea-dev.safetensors",
        }
    }

    fn model_config(&self) -> flux::model::Config {
        match self {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev | FluxVariant::KreaDev => flux::model::Config::dev(),
        }
    }

    fn autoencoder_config(&self) -> flux::autoencoder::Config {
        match self {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev | FluxVariant::KreaDev => flux::autoencoder::Config::dev(),
        }
    }

    /// Guidance-distilled variants shift the schedule with the image sequence length.
    fn schedule(&self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            FluxVariant::Schnell => flux::sampling::get_schedule(steps, None),
            FluxVariant::Dev | FluxVariant::KreaDev => {
                flux::sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15)))
            }
        }
    }
}

/// Rounds a pixel dimension down to the 16-pixel latent patch grid. The
/// sampler would otherwise round up, producing an image larger than asked.
fn align_dimension(value: usize) -> usize {
    (value / LATENT_ALIGN).max(1) * LATENT_ALIGN
}

struct FluxComponents {
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

pub struct FluxModel {
    variant: FluxVariant,
    // seeding and sampling share the device RNG, so a whole run holds the lock
    inner: Mutex<FluxComponents>,
}

impl ModelLike for FluxModel {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage> {
        // a panicked run leaves the weights untouched
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        let height = align_dimension(request.height);
        let width = align_dimension(request.width);

        let seed = request.seed.device_seed().unwrap_or_else(rand::random);
        state.device.set_seed(seed)?;

        // --- Generate noise image ---
        let noise_img = flux::sampling::get_noise(1, height, width, &state.device)?
            .to_dtype(state.dtype)?;

        // --- Compute T5 embedding ---
        let mut t5_tokens = state
            .t5_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_SEQUENCE_LEN, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &state.device)?.unsqueeze(0)?;
        let t5_emb = state.t5_model.forward(&input_token_ids)?;

        // --- Compute CLIP embedding ---
        let mut clip_tokens = state
            .clip_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        clip_tokens.truncate(CLIP_MAX_POSITIONS);
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &state.device)?.unsqueeze(0)?;
        let clip_emb = state.clip_model.forward(&input_token_ids_clip)?;

        // --- Create sampling state and schedule ---
        let sampling_state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = self
            .variant
            .schedule(request.steps, sampling_state.img.dim(1)?);

        let latent_img = flux::sampling::denoise(
            &state.flux_model,
            &sampling_state.img,
            &sampling_state.img_ids,
            &sampling_state.txt,
            &sampling_state.txt_ids,
            &sampling_state.vec,
            &timesteps,
            request.guidance,
        )?;

        let unpacked = flux::sampling::unpack(&latent_img, height, width)?;
        debug!("Generated latent image");

        let decoded = state.autoencoder.decode(&unpacked)?;
        debug!("Decoded image");

        // --- Postprocessing: clamp, scale, convert type ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        tensor_to_image(&img_tensor)
    }
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;
    type Variant = FluxVariant;

    fn required_files(model_id: &str, variant: FluxVariant) -> Vec<RemoteFile> {
        vec![
            RemoteFile::new(T5_REPO, "model.safetensors", T5_WEIGHTS).with_revision(T5_REVISION),
            RemoteFile::new(T5_REPO, "config.json", T5_CONFIG).with_revision(T5_REVISION),
            RemoteFile::new(T5_TOKENIZER_REPO, "t5-v1_1-xxl.tokenizer.json", T5_TOKENIZER),
            RemoteFile::new(CLIP_REPO, "model.safetensors", CLIP_WEIGHTS),
            RemoteFile::new(CLIP_REPO, "tokenizer.json", CLIP_TOKENIZER),
            RemoteFile::new(model_id, "ae.safetensors", AUTOENCODER_WEIGHTS),
            RemoteFile::new(model_id, variant.weights_file(), variant.weights_file()),
        ]
    }

    fn load(variant: FluxVariant, files: &LocalFiles, device_map: DeviceMap) -> Result<FluxModel> {
        // Configure device.
        let device = select_gpu_device(device_map).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();

        // --- Load T5 Model and Tokenizer ---
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[files.path(T5_WEIGHTS)], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let config_str = std::fs::read_to_string(files.path(T5_CONFIG))
            .context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(files.path(T5_TOKENIZER))
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- Load CLIP Model and Tokenizer ---
        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[files.path(CLIP_WEIGHTS)],
                dtype,
                &device,
            )
            .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: CLIP_MAX_POSITIONS,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(files.path(CLIP_TOKENIZER))
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Load Autoencoder ---
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[files.path(AUTOENCODER_WEIGHTS)],
                dtype,
                &device,
            )
            .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Load Flux Model (non-quantized) ---
        let flux_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(
                &[files.path(variant.weights_file())],
                dtype,
                &device,
            )
            .context("failed to build flux var builder")?
        };
        let flux_model =
            Flux::new(&variant.model_config(), flux_vb).context("failed to load flux model")?;

        Ok(FluxModel {
            variant,
            inner: Mutex::new(FluxComponents {
                device,
                dtype,
                t5_model,
                t5_tokenizer,
                clip_model,
                clip_tokenizer,
                autoencoder,
                flux_model,
            }),
        })
    }
}
