pub mod config;
pub mod device_map;
pub mod error;
pub mod loader;
mod loader_factory;
pub mod request;
pub mod store;
mod util;

mod flux;

pub use config::*;
pub use device_map::*;
pub use error::*;
pub use flux::{FluxLoader, FluxModel, FluxVariant};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use request::*;
pub use store::*;
pub(crate) use util::*;

/// A normalized generation job, ready to be handed to a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Seed,
}

pub trait ModelLike: Send + Sync {
    /// Runs one generation and returns the first image of the result set.
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}
