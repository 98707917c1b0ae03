use std::any::Any;
use std::io::Cursor;
use std::panic::AssertUnwindSafe;

use anyhow::{anyhow, Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use futures::FutureExt;
use image::DynamicImage;
use kiln_core::{ErrorKind, JobInput, ModelHandle, Seed};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

pub const IMAGE_FORMAT: &str = "png";

/// Output of one job. Always well-formed, whatever went wrong.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success {
        image: String,
        image_format: &'static str,
        seed: Seed,
    },
    Failure {
        error: String,
        trace: String,
        error_type: ErrorKind,
    },
}

impl JobOutput {
    pub(crate) fn failure(err: &anyhow::Error) -> Self {
        JobOutput::Failure {
            error: format!("{err:#}"),
            trace: format!("{err:?}"),
            error_type: ErrorKind::of(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutput::Success { .. })
    }
}

/// Encodes an image as a base64 PNG.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Maps a job's `input` object to a response using the process model.
pub struct Handler {
    model: ModelHandle,
}

impl Handler {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }

    pub fn model_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    pub async fn handle(&self, input: Value) -> JobOutput {
        let err = match AssertUnwindSafe(self.generate(input)).catch_unwind().await {
            Ok(Ok(output)) => return output,
            Ok(Err(err)) => err,
            Err(payload) => anyhow!("job panicked: {}", panic_message(payload.as_ref())),
        };
        error!("Error: {err:?}");
        JobOutput::failure(&err)
    }

    async fn generate(&self, input: Value) -> Result<JobOutput> {
        let request = JobInput::from_value(input)?.normalize()?;
        let seed = request.seed;

        let model = self.model.ensure_loaded().await?;

        info!("Generating image with prompt: {}", request.prompt);
        let image = tokio::task::spawn_blocking(move || {
            let image = model.run(request)?;
            image_to_base64_png(&image)
        })
        .await
        .map_err(|e| match e.try_into_panic() {
            Ok(payload) => anyhow!("generation panicked: {}", panic_message(payload.as_ref())),
            Err(e) => anyhow!(e),
        })??;

        Ok(JobOutput::Success {
            image,
            image_format: IMAGE_FORMAT,
            seed,
        })
    }
}
