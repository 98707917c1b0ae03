use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::{Error, GenerationRequest};

pub const DEFAULT_DIMENSION: i64 = 1024;
pub const MIN_DIMENSION: i64 = 512;
pub const MAX_DIMENSION: i64 = 2048;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 4.5;
pub const DEFAULT_INFERENCE_STEPS: u64 = 50;
pub const RANDOM_SEED: i64 = -1;

/// Raw `input` object of a job. Every field is optional; unknown fields are
/// ignored and `null` counts as absent.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobInput {
    pub prompt: Option<String>,
    pub height: Option<i64>,
    pub width: Option<i64>,
    pub guidance_scale: Option<f64>,
    pub num_inference_steps: Option<u64>,
    pub seed: Option<i64>,
}

impl JobInput {
    pub fn from_value(value: Value) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    /// Applies defaults, rejects an empty prompt and clamps both dimensions.
    /// Guidance and step count are passed through untouched.
    pub fn normalize(self) -> Result<GenerationRequest, Error> {
        let prompt = self.prompt.unwrap_or_default();
        if prompt.is_empty() {
            return Err(Error::EmptyPrompt);
        }

        Ok(GenerationRequest {
            prompt,
            width: clamp_dimension(self.width.unwrap_or(DEFAULT_DIMENSION)),
            height: clamp_dimension(self.height.unwrap_or(DEFAULT_DIMENSION)),
            steps: self.num_inference_steps.unwrap_or(DEFAULT_INFERENCE_STEPS) as usize,
            guidance: self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
            seed: Seed::from(self.seed.unwrap_or(RANDOM_SEED)),
        })
    }
}

pub fn clamp_dimension(value: i64) -> usize {
    value.clamp(MIN_DIMENSION, MAX_DIMENSION) as usize
}

/// Seed of a generation run. `-1` on the wire means unseeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seed {
    Random,
    Fixed(i64),
}

impl Seed {
    /// Value for the device RNG. Negative seeds wrap like a two's-complement
    /// cast; `Random` has no fixed value.
    pub fn device_seed(&self) -> Option<u64> {
        match self {
            Seed::Random => None,
            Seed::Fixed(seed) => Some(*seed as u64),
        }
    }
}

impl From<i64> for Seed {
    fn from(value: i64) -> Self {
        if value == RANDOM_SEED {
            Seed::Random
        } else {
            Seed::Fixed(value)
        }
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Seed::Random => serializer.serialize_str("random"),
            Seed::Fixed(seed) => serializer.serialize_i64(*seed),
        }
    }
}
