use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::{ArchitectureFamily, EncoderSlot, Precision, SchedulerChoice};

/// Which job a pipeline performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Task {
    TextToImage,
    ImageToImage,
}

/// Where the base weights of a model come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Hub { repo: String, weights_file: String },
    Archive { path: PathBuf },
}

#[derive(Clone, Debug)]
pub struct LoadRequest {
    /// Catalog key or custom model id. Cached encoders are keyed by it.
    pub identity: String,
    pub family: ArchitectureFamily,
    pub source: ModelSource,
    /// Declared storage precision of an archive, if the caller knows it.
    pub precision: Option<Precision>,
}

/// A text encoder that can run a forward pass over token ids.
pub trait TextEncoder: Send + Sync {
    fn num_layers(&self) -> usize;

    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;
}

pub type SharedEncoder = Arc<dyn TextEncoder>;

/// How a pipeline accepts adapters.
///
/// `Staged` pipelines collect adapters with [`Pipeline::stage_adapter`] and
/// fuse the whole staged set in one [`Pipeline::commit_adapters`] call.
/// `Direct` pipelines fuse each adapter as it arrives through
/// [`Pipeline::fuse_adapter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterMechanism {
    Staged,
    Direct,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdapterSpec {
    pub name: String,
    pub path: PathBuf,
    pub weight: f64,
}

pub struct InitImage {
    /// u8 pixels shaped (3, height, width), already resized to the output size.
    pub image: Tensor,
    pub strength: f64,
}

/// A fully resolved generation request as seen by one pipeline.
pub struct PipelineRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub num_images: usize,
    pub seed: Option<u64>,
    pub init: Option<InitImage>,
}

/// One live generative pipeline.
pub trait Pipeline: Send {
    fn task(&self) -> Task;

    fn generate(&mut self, request: &PipelineRequest) -> Result<Vec<DynamicImage>>;

    fn encoder_slots(&self) -> &[EncoderSlot];

    fn text_encoder(&self, slot: EncoderSlot) -> Option<SharedEncoder>;

    fn replace_text_encoder(&mut self, slot: EncoderSlot, encoder: SharedEncoder) -> Result<()>;

    /// Builds a fresh encoder for `slot` keeping only the first `layers`
    /// transformer layers. Only that component's weights are reloaded.
    fn build_truncated_encoder(&self, slot: EncoderSlot, layers: usize) -> Result<SharedEncoder>;

    fn adapter_mechanism(&self) -> AdapterMechanism;

    fn stage_adapter(&mut self, adapter: &AdapterSpec) -> Result<()> {
        anyhow::bail!("pipeline does not stage adapters (tried '{}')", adapter.name)
    }

    fn commit_adapters(&mut self) -> Result<()> {
        anyhow::bail!("pipeline does not stage adapters")
    }

    fn fuse_adapter(&mut self, adapter: &AdapterSpec) -> Result<()> {
        anyhow::bail!("pipeline does not fuse adapters directly (tried '{}')", adapter.name)
    }

    /// Drops every fused or staged adapter. Idempotent.
    fn unfuse_adapters(&mut self) -> Result<()>;

    fn supports_scheduler(&self, choice: SchedulerChoice) -> bool;

    fn set_scheduler(&mut self, choice: SchedulerChoice) -> Result<()>;
}

/// The single live set of pipelines for one loaded base model.
pub struct RuntimeHandle {
    pub identity: String,
    pub family: ArchitectureFamily,
    pub text_to_image: Box<dyn Pipeline>,
    pub image_to_image: Option<Box<dyn Pipeline>>,
    pub device: Device,
    pub precision: Precision,
}

impl RuntimeHandle {
    pub fn pipelines_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Pipeline>> {
        std::iter::once(&mut self.text_to_image).chain(self.image_to_image.as_mut())
    }

    pub fn pipeline_mut(&mut self, task: Task) -> Option<&mut Box<dyn Pipeline>> {
        match task {
            Task::TextToImage => Some(&mut self.text_to_image),
            Task::ImageToImage => self.image_to_image.as_mut(),
        }
    }
}

/// Builds runtime handles and reclaims device memory.
pub trait Loader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<RuntimeHandle>;

    /// Best-effort release of cached device memory.
    fn reclaim(&self) -> Result<()>;
}
