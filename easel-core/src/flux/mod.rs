use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::{
    flux::{
        self,
        autoencoder::AutoEncoder,
        model::{self, Flux},
    },
    t5,
};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod encoders;
mod lora;
mod resident;

use encoders::{ClipEncoder, T5Encoder, CLIP_LAYERS};
use resident::Resident;

use crate::{
    tensor_to_image, AdapterMechanism, AdapterSpec, ArchitectureFamily, EncoderSlot,
    FluxVariant, LoadRequest, ModelSource, Pipeline, PipelineRequest, Precision, RuntimeHandle,
    SchedulerChoice, SharedEncoder, Task,
};

const T5_TOKENS: usize = 256;
const CLIP_TOKENS: usize = 77;
const SLOTS: &[EncoderSlot] = &[EncoderSlot::Primary, EncoderSlot::Secondary];
const AUTOENCODER_REPO: &str = "black-forest-labs/FLUX.1-schnell";
const CHECKPOINT_PREFIX: &str = "model.diffusion_model.";

type AdapterKey = (PathBuf, u64);

fn adapter_key(spec: &AdapterSpec) -> AdapterKey {
    (spec.path.clone(), spec.weight.to_bits())
}

/// Weights shared by the text-to-image and image-to-image pipelines of one
/// loaded model.
struct FluxShared {
    device: Device,
    dtype: DType,
    config: model::Config,
    /// Unfused transformer weights, held in host memory.
    base: HashMap<String, Tensor>,
    transformer: Resident<Flux, Vec<AdapterKey>>,
    recent_deltas: Mutex<HashMap<AdapterKey, Arc<HashMap<String, Tensor>>>>,
    autoencoder: AutoEncoder,
    clip_tokenizer: Tokenizer,
    t5_tokenizer: Tokenizer,
    clip_weights: PathBuf,
    t5_weights: PathBuf,
    t5_config: t5::Config,
}

/// Builds a transformer on `device` from weights in any location.
fn build_transformer(
    config: &model::Config,
    weights: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<Flux> {
    let vb = candle_nn::VarBuilder::from_tensors(weights, dtype, device);
    Flux::new(config, vb).context("failed to build flux transformer")
}

impl FluxShared {
    /// Swaps the resident transformer for one built from `weights`.
    fn rebuild(&self, weights: HashMap<String, Tensor>, fused: Vec<AdapterKey>) -> Result<()> {
        self.transformer.replace(fused, || {
            build_transformer(&self.config, weights, self.dtype, &self.device)
        })
    }
}

pub struct FluxPipeline {
    task: Task,
    variant: FluxVariant,
    shared: Arc<FluxShared>,
    clip: SharedEncoder,
    t5: SharedEncoder,
    staged: Vec<(AdapterKey, Arc<HashMap<String, Tensor>>)>,
    shifted_schedule: bool,
}

/// Number of leading schedule entries to skip for an img2img strength.
fn init_offset(steps: usize, strength: f64) -> usize {
    let denoised = ((steps as f64) * strength).round() as usize;
    steps - denoised.min(steps)
}

impl FluxPipeline {
    fn tokens(&self, tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>> {
        Ok(tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec())
    }

    fn encode_prompt(&self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let device = &self.shared.device;

        let mut t5_tokens = self.tokens(&self.shared.t5_tokenizer, prompt)?;
        t5_tokens.resize(T5_TOKENS, 0);
        let t5_ids = Tensor::new(&*t5_tokens, device)?.unsqueeze(0)?;
        let t5_emb = self.t5.encode(&t5_ids)?;

        let mut clip_tokens = self.tokens(&self.shared.clip_tokenizer, prompt)?;
        clip_tokens.truncate(CLIP_TOKENS);
        let clip_ids = Tensor::new(&*clip_tokens, device)?.unsqueeze(0)?;
        let clip_emb = self.clip.encode(&clip_ids)?;

        Ok((t5_emb, clip_emb))
    }

    /// Encodes u8 pixels shaped (3, h, w) into the autoencoder latent space.
    fn encode_image(&self, image: &Tensor) -> Result<Tensor> {
        let pixels = ((image.to_dtype(DType::F32)? / 127.5)? - 1.0)?
            .unsqueeze(0)?
            .to_dtype(self.shared.dtype)?;
        Ok(self.shared.autoencoder.encode(&pixels)?)
    }

    fn deltas_for(&self, spec: &AdapterSpec) -> Result<Arc<HashMap<String, Tensor>>> {
        let key = adapter_key(spec);
        if let Some(deltas) = self
            .shared
            .recent_deltas
            .lock()
            .map_err(|_| anyhow!("adapter lock poisoned"))?
            .get(&key)
        {
            return Ok(deltas.clone());
        }
        let deltas = lora::load_deltas(
            &spec.path,
            spec.weight,
            &self.shared.base,
            self.shared.dtype,
            &Device::Cpu,
        )?;
        Ok(Arc::new(deltas))
    }
}

impl Pipeline for FluxPipeline {
    fn task(&self) -> Task {
        self.task
    }

    fn generate(&mut self, request: &PipelineRequest) -> Result<Vec<DynamicImage>> {
        let (width, height) = (request.width, request.height);
        if width % 16 != 0 || height % 16 != 0 {
            bail!("FLUX needs width and height divisible by 16, got {width}x{height}");
        }
        let device = &self.shared.device;
        let dtype = self.shared.dtype;

        if let Some(seed) = request.seed {
            if let Err(e) = device.set_seed(seed) {
                warn!(seed, "device does not accept a seed: {e}");
            }
        }
        if request.negative_prompt.is_some() {
            debug!("FLUX ignores negative prompts");
        }

        let (t5_emb, clip_emb) = self.encode_prompt(&request.prompt)?;
        let init = match &request.init {
            Some(init) => Some((self.encode_image(&init.image)?, init.strength)),
            None => None,
        };
        let transformer = self.shared.transformer.get()?;
        let image_seq_len = (height / 16) * (width / 16);
        let shift = self.shifted_schedule.then_some((image_seq_len, 0.5, 1.15));

        let mut images = Vec::with_capacity(request.num_images);
        for index in 0..request.num_images {
            let noise = flux::sampling::get_noise(1, height, width, device)?.to_dtype(dtype)?;
            let mut timesteps = flux::sampling::get_schedule(request.steps, shift);
            let start = match &init {
                Some((latent, strength)) => {
                    let offset = init_offset(request.steps, *strength);
                    timesteps.drain(..offset);
                    let t0 = timesteps[0];
                    (latent.affine(1.0 - t0, 0.0)? + noise.affine(t0, 0.0)?)?
                }
                None => noise,
            };

            let state = flux::sampling::State::new(&t5_emb, &clip_emb, &start)?;
            let latent = flux::sampling::denoise(
                &*transformer,
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                &timesteps,
                request.guidance_scale,
            )?;
            let unpacked = flux::sampling::unpack(&latent, height, width)?;
            let decoded = self.shared.autoencoder.decode(&unpacked)?;
            let pixels = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
            images.push(tensor_to_image(&pixels.i(0)?)?);
            debug!(index, steps = timesteps.len() - 1, "decoded image");
        }
        Ok(images)
    }

    fn encoder_slots(&self) -> &[EncoderSlot] {
        SLOTS
    }

    fn text_encoder(&self, slot: EncoderSlot) -> Option<SharedEncoder> {
        Some(match slot {
            EncoderSlot::Primary => self.clip.clone(),
            EncoderSlot::Secondary => self.t5.clone(),
        })
    }

    fn replace_text_encoder(&mut self, slot: EncoderSlot, encoder: SharedEncoder) -> Result<()> {
        match slot {
            EncoderSlot::Primary => self.clip = encoder,
            EncoderSlot::Secondary => self.t5 = encoder,
        }
        Ok(())
    }

    fn build_truncated_encoder(&self, slot: EncoderSlot, layers: usize) -> Result<SharedEncoder> {
        let shared = &self.shared;
        Ok(match slot {
            EncoderSlot::Primary => Arc::new(ClipEncoder::load(
                &shared.clip_weights,
                layers,
                shared.dtype,
                &shared.device,
            )?),
            EncoderSlot::Secondary => Arc::new(T5Encoder::load(
                &shared.t5_weights,
                &shared.t5_config,
                layers,
                shared.dtype,
                &shared.device,
            )?),
        })
    }

    fn adapter_mechanism(&self) -> AdapterMechanism {
        AdapterMechanism::Staged
    }

    fn stage_adapter(&mut self, adapter: &AdapterSpec) -> Result<()> {
        let deltas = self
            .deltas_for(adapter)
            .with_context(|| format!("failed to prepare adapter '{}'", adapter.name))?;
        self.staged.push((adapter_key(adapter), deltas));
        Ok(())
    }

    fn commit_adapters(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let keys: Vec<AdapterKey> = staged.iter().map(|(key, _)| key.clone()).collect();
        let shared = &self.shared;
        if shared.transformer.tag()? == keys && shared.transformer.is_resident()? {
            return Ok(());
        }
        let weights = if staged.is_empty() {
            shared.base.clone()
        } else {
            let deltas: Vec<&HashMap<String, Tensor>> =
                staged.iter().map(|(_, deltas)| deltas.as_ref()).collect();
            lora::merge(&shared.base, &deltas)?
        };
        shared.rebuild(weights, keys)?;
        *shared
            .recent_deltas
            .lock()
            .map_err(|_| anyhow!("adapter lock poisoned"))? = staged.into_iter().collect();
        info!(task = ?self.task, "rebuilt transformer with staged adapters");
        Ok(())
    }

    fn unfuse_adapters(&mut self) -> Result<()> {
        self.staged.clear();
        let shared = &self.shared;
        if !shared.transformer.tag()?.is_empty() || !shared.transformer.is_resident()? {
            shared.rebuild(shared.base.clone(), Vec::new())?;
            debug!("restored base transformer");
        }
        Ok(())
    }

    fn supports_scheduler(&self, choice: SchedulerChoice) -> bool {
        choice.is_flow_matching()
    }

    fn set_scheduler(&mut self, choice: SchedulerChoice) -> Result<()> {
        match choice {
            SchedulerChoice::FlowMatchEuler => self.shifted_schedule = false,
            SchedulerChoice::FlowMatchEulerShifted => self.shifted_schedule = true,
            other => bail!("FLUX cannot sample with {other}"),
        }
        debug!(variant = ?self.variant, scheduler = %choice, "configured sampler");
        Ok(())
    }
}

/// Loads the transformer weights into host memory, dropping the prefix
/// single-file checkpoints carry.
fn load_transformer_weights(path: &Path, dtype: DType) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read transformer weights {}", path.display()))?;
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = name
                .strip_prefix(CHECKPOINT_PREFIX)
                .map(str::to_string)
                .unwrap_or(name);
            Ok((name, tensor.to_dtype(dtype)?))
        })
        .collect()
}

pub struct FluxLoader;

impl FluxLoader {
    pub fn load(request: &LoadRequest, api: &Api, device: &Device, dtype: DType) -> Result<RuntimeHandle> {
        let ArchitectureFamily::Flux(variant) = request.family else {
            bail!("{} is not a FLUX model", request.family);
        };
        let (model_config, autoencoder_config) = match variant {
            FluxVariant::Schnell => (model::Config::schnell(), flux::autoencoder::Config::schnell()),
            FluxVariant::Dev | FluxVariant::Kontext => {
                (model::Config::dev(), flux::autoencoder::Config::dev())
            }
        };
        if let Some(precision) = &request.precision {
            debug!(declared = %precision, "archive precision is converted to the device dtype");
        }

        // --- T5 encoder and tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_weights = t5_repo
            .get("model.safetensors")
            .context("failed to get T5 model file")?;
        let config_filename = t5_repo.get("config.json").context("failed to get T5 config")?;
        let config_str =
            std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5 = T5Encoder::load(&t5_weights, &t5_config, t5_config.num_layers, dtype, device)?;
        let t5_tokenizer_filename = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP encoder and tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_weights = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip = ClipEncoder::load(&clip_weights, CLIP_LAYERS, dtype, device)?;
        let clip_tokenizer_filename = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_filename)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let autoencoder_file = api
            .model(AUTOENCODER_REPO.to_string())
            .get("ae.safetensors")
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[autoencoder_file], dtype, device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Transformer ---
        let transformer_file = match &request.source {
            ModelSource::Hub { repo, weights_file } => api
                .model(repo.clone())
                .get(weights_file)
                .with_context(|| format!("failed to get {weights_file} from {repo}"))?,
            ModelSource::Archive { path } => path.clone(),
        };
        let base = load_transformer_weights(&transformer_file, dtype)?;
        let transformer = build_transformer(&model_config, base.clone(), dtype, device)?;
        info!(identity = %request.identity, ?variant, "loaded FLUX components");

        let shared = Arc::new(FluxShared {
            device: device.clone(),
            dtype,
            config: model_config,
            base,
            transformer: Resident::new(transformer, Vec::new()),
            recent_deltas: Mutex::new(HashMap::new()),
            autoencoder,
            clip_tokenizer,
            t5_tokenizer,
            clip_weights,
            t5_weights,
            t5_config,
        });
        let clip: SharedEncoder = Arc::new(clip);
        let t5: SharedEncoder = Arc::new(t5);
        let pipeline = |task| FluxPipeline {
            task,
            variant,
            shared: shared.clone(),
            clip: clip.clone(),
            t5: t5.clone(),
            staged: Vec::new(),
            shifted_schedule: variant != FluxVariant::Schnell,
        };

        Ok(RuntimeHandle {
            identity: request.identity.clone(),
            family: request.family,
            text_to_image: Box::new(pipeline(Task::TextToImage)),
            image_to_image: request
                .family
                .supports_image_to_image()
                .then(|| Box::new(pipeline(Task::ImageToImage)) as Box<dyn Pipeline>),
            device: device.clone(),
            precision: Precision::from_candle(dtype),
        })
    }
}
