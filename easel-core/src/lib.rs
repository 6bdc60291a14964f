pub mod adapters;
pub mod catalog;
pub mod config;
pub mod device_map;
pub mod encoder_cache;
pub mod error;
pub mod family;
pub mod loader;
mod loader_factory;
pub mod manager;
pub mod resources;
pub mod response;
pub mod scheduler;
pub mod sniffer;
pub mod store;
pub mod telemetry;
mod util;

mod flux;

#[cfg(test)]
mod testing;

pub use adapters::*;
pub use catalog::ModelCatalogEntry;
pub use config::Config;
pub use device_map::*;
pub use encoder_cache::{CacheStats, EncoderCache};
pub use error::{EaselError, ErrorKind, Result};
pub use family::*;
pub use flux::FluxLoader;
pub use loader::*;
pub use loader_factory::*;
pub use manager::*;
pub use resources::*;
pub use response::ApiResponse;
pub use scheduler::SchedulerChoice;
pub use sniffer::ArchiveInfo;
pub use store::*;
pub use util::*;

use serde::{Deserialize, Serialize};

/// A generation request as received from a caller. Missing values fall back
/// to [`Config`] defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub num_images: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub scheduler: Option<SchedulerChoice>,
    /// Declared-active adapters, in fusing order.
    #[serde(default)]
    pub adapters: Vec<AdapterDeclaration>,
    /// Text encoder skip depth. 0 uses the full encoders.
    #[serde(default)]
    pub clip_skip: usize,
    /// Base64 image, optionally as a `data:` URL. Selects image-to-image.
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub strength: Option<f64>,
}
