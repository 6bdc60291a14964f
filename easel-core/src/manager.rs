//! The single runtime slot and the entry points that drive it.
//!
//! Every mutation of the slot runs on the blocking pool while holding one
//! FIFO `tokio::sync::Mutex`, so concurrent callers queue up in arrival
//! order. Read-only projections are served from a snapshot republished after
//! each mutation and never touch the live handle.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    catalog, decode_reference_image, device_label, sniffer, AdapterComposer, AdapterDeclaration,
    ApiResponse, ArchitectureFamily, ArchiveInfo, CacheStats, CandleLoader, Capability,
    CompositionReport, Config, EaselError, EncoderCache, FusedAdapter, GenerationRequest,
    InitImage, LoadRequest, Loader, ModelSource, PipelineRequest, Precision, ResourceInfo,
    ResourceMonitor, Result, RuntimeHandle, SchedulerChoice, SkippedAdapter, Task,
    MAX_ACTIVE_ADAPTERS,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub model: String,
    pub name: String,
    pub family: ArchitectureFamily,
    pub device: String,
    pub precision: Precision,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomModelRequest {
    pub path: PathBuf,
    /// Detected from the archive header when absent.
    #[serde(default)]
    pub family: Option<ArchitectureFamily>,
    #[serde(default)]
    pub precision: Option<Precision>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A local archive registered under a generated `custom-<n>` id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomModel {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub family: ArchitectureFamily,
    pub precision: Option<Precision>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GenerationOutput {
    #[serde(skip)]
    pub images: Vec<DynamicImage>,
    pub count: usize,
    pub model: String,
    pub adapters: Vec<FusedAdapter>,
    /// Adapters fused for this generation.
    pub loaded_count: usize,
    /// Declared adapters that were left out, with the reason.
    pub skipped: Vec<SkippedAdapter>,
    pub clip_skip: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentModel {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelListing {
    pub key: String,
    pub name: String,
    pub capability: Option<Capability>,
    pub capabilities: Vec<Capability>,
    pub family: ArchitectureFamily,
    pub loaded: bool,
    pub downloaded: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cleared {
    pub cleared: usize,
}

#[derive(Clone, Debug, Default)]
struct Snapshot {
    current: CurrentModel,
    fused: Vec<FusedAdapter>,
    clip_skip: usize,
    cache: CacheStats,
}

struct LoadPlan {
    request: LoadRequest,
    name: String,
}

/// A generation request with defaults filled in and validated.
struct Prepared {
    pipeline: PipelineRequest,
    reference: Option<(String, f64)>,
    scheduler: Option<SchedulerChoice>,
    adapters: Vec<AdapterDeclaration>,
    clip_skip: usize,
}

struct RuntimeSlot {
    loader: Arc<dyn Loader>,
    monitor: Arc<ResourceMonitor>,
    handle: Option<RuntimeHandle>,
    loaded: Option<LoadedModel>,
    composer: AdapterComposer,
    cache: EncoderCache,
    /// Declarations applied by the last reconciliation since the load.
    applied: Option<Vec<AdapterDeclaration>>,
    /// Adapters the last reconciliation left out.
    skipped: Vec<SkippedAdapter>,
}

impl RuntimeSlot {
    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!(model = %handle.identity, "releasing model");
            drop(handle);
            self.monitor.reclaim();
        }
        self.loaded = None;
        self.composer.reset();
        self.cache.reset();
        self.applied = None;
        self.skipped.clear();
    }

    fn load(&mut self, plan: LoadPlan) -> Result<LoadedModel> {
        self.release();
        let handle = self
            .loader
            .load(&plan.request)
            .map_err(EaselError::runtime)?;
        let loaded = LoadedModel {
            model: handle.identity.clone(),
            name: plan.name,
            family: handle.family,
            device: device_label(&handle.device),
            precision: handle.precision.clone(),
        };
        info!(
            model = %loaded.model,
            family = %loaded.family,
            device = %loaded.device,
            precision = %loaded.precision,
            "model loaded"
        );
        self.handle = Some(handle);
        self.loaded = Some(loaded.clone());
        Ok(loaded)
    }

    fn sync_adapters(&mut self, declarations: Vec<AdapterDeclaration>) -> Result<CompositionReport> {
        let Some(handle) = self.handle.as_mut() else {
            if declarations.len() > MAX_ACTIVE_ADAPTERS {
                return Err(EaselError::AdapterLimitExceeded {
                    requested: declarations.len(),
                    max: MAX_ACTIVE_ADAPTERS,
                });
            }
            debug!("no model loaded, adapters will be applied on the next generation");
            return Ok(CompositionReport {
                requested: declarations.len(),
                ..Default::default()
            });
        };
        let report = self.composer.apply_active_adapters(handle, &declarations)?;
        self.applied = Some(declarations);
        self.skipped = report.skipped.clone();
        Ok(report)
    }

    fn clear_adapters(&mut self) -> Cleared {
        let cleared = self.composer.fused().len();
        if let Some(handle) = self.handle.as_mut() {
            self.composer.clear(handle);
            self.applied = Some(Vec::new());
            self.skipped.clear();
        }
        Cleared { cleared }
    }

    fn generate(&mut self, default_plan: Result<LoadPlan>, prepared: Prepared) -> Result<GenerationOutput> {
        if self.handle.is_none() {
            let plan = default_plan?;
            info!(model = %plan.request.identity, "no model loaded, loading the default");
            self.load(plan)?;
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(EaselError::ResourceUnavailable("no model is loaded".into()));
        };

        let Prepared {
            mut pipeline,
            reference,
            scheduler,
            adapters,
            clip_skip,
        } = prepared;

        if self.applied.as_deref() != Some(adapters.as_slice()) {
            let report = self.composer.apply_active_adapters(handle, &adapters)?;
            if !report.skipped.is_empty() {
                warn!(
                    requested = report.requested,
                    loaded = report.loaded_count,
                    "some declared adapters were skipped"
                );
            }
            self.skipped = report.skipped;
            self.applied = Some(adapters);
        }
        self.cache.apply_depth(handle, clip_skip)?;

        let task = if reference.is_some() {
            Task::ImageToImage
        } else {
            Task::TextToImage
        };
        let family = handle.family;
        let identity = handle.identity.clone();
        let device = handle.device.clone();
        let runner = handle.pipeline_mut(task).ok_or_else(|| {
            EaselError::InvalidInput(format!("{family} models do not support image-to-image"))
        })?;
        if let Some((encoded, strength)) = reference {
            let image = decode_reference_image(&encoded, pipeline.width, pipeline.height, &device)?;
            pipeline.init = Some(InitImage { image, strength });
        }
        if let Some(choice) = scheduler {
            if runner.supports_scheduler(choice) {
                runner.set_scheduler(choice).map_err(EaselError::runtime)?;
            } else {
                warn!(scheduler = %choice, %family, "scheduler not supported, keeping the current sampler");
            }
        }

        info!(
            model = %identity,
            ?task,
            width = pipeline.width,
            height = pipeline.height,
            steps = pipeline.steps,
            num_images = pipeline.num_images,
            clip_skip,
            "generating"
        );
        let images = runner.generate(&pipeline).map_err(EaselError::runtime)?;
        Ok(GenerationOutput {
            count: images.len(),
            images,
            model: identity,
            adapters: self.composer.fused().to_vec(),
            loaded_count: self.composer.fused().len(),
            skipped: self.skipped.clone(),
            clip_skip: self.cache.current_depth(),
        })
    }

    fn snapshot(&self) -> Snapshot {
        let current = match &self.loaded {
            Some(loaded) => CurrentModel {
                loaded: true,
                key: Some(loaded.model.clone()),
                name: Some(loaded.name.clone()),
                capability: loaded.family.primary_capability(),
                device: Some(loaded.device.clone()),
            },
            None => CurrentModel::default(),
        };
        Snapshot {
            current,
            fused: self.composer.fused().to_vec(),
            clip_skip: self.cache.current_depth(),
            cache: self.cache.stats(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn invalid(message: impl Into<String>) -> EaselError {
    EaselError::InvalidInput(message.into())
}

/// Owns the single live runtime handle.
pub struct ModelManager {
    config: Config,
    monitor: Arc<ResourceMonitor>,
    slot: Arc<Mutex<RuntimeSlot>>,
    snapshot: Arc<ArcSwap<Snapshot>>,
    custom_models: DashMap<String, CustomModel>,
    next_custom_id: AtomicU64,
}

impl ModelManager {
    pub fn new(config: Config, loader: Arc<dyn Loader>) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(config.device_map(), loader.clone()));
        let slot = RuntimeSlot {
            loader,
            monitor: monitor.clone(),
            handle: None,
            loaded: None,
            composer: AdapterComposer::new(),
            cache: EncoderCache::new(),
            applied: None,
            skipped: Vec::new(),
        };
        Self {
            config,
            monitor,
            slot: Arc::new(Mutex::new(slot)),
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::default())),
            custom_models: DashMap::new(),
            next_custom_id: AtomicU64::new(0),
        }
    }

    /// A manager backed by the candle runtime on the configured device.
    pub fn with_candle(config: Config) -> anyhow::Result<Self> {
        let loader = CandleLoader::new(config.device_map(), config.models_dir.clone())?;
        Ok(Self::new(config, Arc::new(loader)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` against the slot on the blocking pool. A panic inside the
    /// runtime drops the handle and becomes a `RuntimeFailure`.
    async fn with_slot<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RuntimeSlot) -> Result<T> + Send + 'static,
    {
        let mut guard = self.slot.clone().lock_owned().await;
        let snapshot = self.snapshot.clone();
        tokio::task::spawn_blocking(move || {
            let slot = &mut *guard;
            let outcome = match catch_unwind(AssertUnwindSafe(|| f(slot))) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(op, "runtime panicked: {message}");
                    slot.release();
                    Err(EaselError::RuntimeFailure(format!("{op} panicked: {message}")))
                }
            };
            snapshot.store(Arc::new(slot.snapshot()));
            outcome
        })
        .await
        .map_err(|e| EaselError::RuntimeFailure(format!("{op} task failed: {e}")))?
    }

    fn plan(&self, key: &str) -> Result<LoadPlan> {
        if let Some(entry) = catalog::lookup(key) {
            return Ok(LoadPlan {
                request: LoadRequest {
                    identity: entry.key.to_string(),
                    family: entry.family,
                    source: entry.source(),
                    precision: None,
                },
                name: entry.name.to_string(),
            });
        }
        let custom = self
            .custom_models
            .get(key)
            .ok_or_else(|| EaselError::UnknownModel(key.to_string()))?;
        Ok(LoadPlan {
            request: LoadRequest {
                identity: custom.id.clone(),
                family: custom.family,
                source: ModelSource::Archive {
                    path: custom.path.clone(),
                },
                precision: custom.precision.clone(),
            },
            name: custom.name.clone(),
        })
    }

    fn respond<T>(op: &str, result: Result<T>) -> ApiResponse<T> {
        if let Err(err) = &result {
            error!(op, kind = ?err.kind(), "{err}");
        }
        result.into()
    }

    /// Loads a catalog model or a registered custom model, replacing whatever
    /// is resident. Reloading the same key starts from a clean slate too.
    pub async fn load_model(&self, key: &str) -> ApiResponse<LoadedModel> {
        let result = match self.plan(key) {
            Ok(plan) => self.with_slot("load_model", move |slot| slot.load(plan)).await,
            Err(err) => Err(err),
        };
        Self::respond("load_model", result)
    }

    /// Registers a local `.safetensors` archive without loading it. Whatever
    /// of family and precision is not declared is sniffed from the header.
    pub fn register_custom_model(&self, request: CustomModelRequest) -> Result<CustomModel> {
        let is_safetensors = request
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        if !is_safetensors {
            return Err(invalid(format!(
                "{} is not a .safetensors archive",
                request.path.display()
            )));
        }

        let detected = match (request.family, &request.precision) {
            (Some(_), Some(_)) => None,
            _ => Some(sniffer::detect(&request.path)),
        };
        let family = request
            .family
            .or_else(|| detected.as_ref().map(|info| info.family))
            .unwrap_or(ArchitectureFamily::Unknown);
        let precision = request.precision.or_else(|| {
            detected
                .as_ref()
                .map(|info| info.precision.clone())
                .filter(|precision| *precision != Precision::Unknown)
        });
        if family == ArchitectureFamily::Unknown {
            return Err(invalid(format!(
                "could not determine the architecture of {}",
                request.path.display()
            )));
        }
        if !request.path.is_file() {
            return Err(invalid(format!("{} is not a file", request.path.display())));
        }

        let id = format!("custom-{}", self.next_custom_id.fetch_add(1, Ordering::SeqCst) + 1);
        let name = request.name.unwrap_or_else(|| {
            request
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.clone())
        });
        let model = CustomModel {
            id: id.clone(),
            name,
            path: request.path,
            family,
            precision,
        };
        info!(id = %model.id, family = %model.family, path = %model.path.display(), "registered custom model");
        self.custom_models.insert(id, model.clone());
        Ok(model)
    }

    pub async fn load_custom_model(&self, request: CustomModelRequest) -> ApiResponse<LoadedModel> {
        let model = match self.register_custom_model(request) {
            Ok(model) => model,
            Err(err) => return Self::respond("load_custom_model", Err(err)),
        };
        let response = self.load_model(&model.id).await;
        if !response.is_success() {
            self.custom_models.remove(&model.id);
        }
        response
    }

    fn prepare(&self, request: GenerationRequest) -> Result<Prepared> {
        let config = &self.config;
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        let width = request.width.unwrap_or(config.default_width);
        let height = request.height.unwrap_or(config.default_height);
        if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
            return Err(invalid(format!(
                "width and height must be non-zero multiples of 8, got {width}x{height}"
            )));
        }
        let num_images = request.num_images.unwrap_or(1);
        if !(1..=config.max_batch).contains(&num_images) {
            return Err(invalid(format!(
                "num_images must be between 1 and {}, got {num_images}",
                config.max_batch
            )));
        }
        let steps = request.steps.unwrap_or(config.default_steps);
        if steps == 0 {
            return Err(invalid("steps must be at least 1"));
        }
        let guidance_scale = request.guidance_scale.unwrap_or(config.default_guidance);
        if !guidance_scale.is_finite() {
            return Err(invalid("guidance_scale must be a finite number"));
        }
        let reference = match request.reference_image {
            Some(encoded) if encoded.trim().is_empty() => {
                return Err(invalid("reference image is empty"));
            }
            Some(encoded) => {
                let strength = request.strength.unwrap_or(config.default_strength);
                if !(0.0..=1.0).contains(&strength) {
                    return Err(invalid(format!("strength must be within [0, 1], got {strength}")));
                }
                Some((encoded, strength))
            }
            None => None,
        };

        Ok(Prepared {
            pipeline: PipelineRequest {
                prompt,
                negative_prompt: request.negative_prompt.filter(|p| !p.trim().is_empty()),
                width,
                height,
                steps,
                guidance_scale,
                num_images,
                seed: request.seed,
                init: None,
            },
            reference,
            scheduler: request.scheduler,
            adapters: request.adapters,
            clip_skip: request.clip_skip,
        })
    }

    /// Runs one generation, loading the default model first when nothing is
    /// resident. Uses the image-to-image pipeline when a reference image is
    /// given.
    pub async fn generate(&self, request: GenerationRequest) -> ApiResponse<GenerationOutput> {
        let result = match self.prepare(request) {
            Ok(prepared) => {
                let default_plan = self.plan(&self.config.default_model);
                self.with_slot("generate", move |slot| slot.generate(default_plan, prepared))
                    .await
            }
            Err(err) => Err(err),
        };
        Self::respond("generate", result)
    }

    /// Reconciles the fused set with `declarations` outside of a generation.
    pub async fn sync_adapters(&self, declarations: Vec<AdapterDeclaration>) -> ApiResponse<CompositionReport> {
        let result = self
            .with_slot("sync_adapters", move |slot| slot.sync_adapters(declarations))
            .await;
        Self::respond("sync_adapters", result)
    }

    pub async fn clear_adapters(&self) -> ApiResponse<Cleared> {
        let result = self
            .with_slot("clear_adapters", |slot| Ok(slot.clear_adapters()))
            .await;
        Self::respond("clear_adapters", result)
    }

    /// Drops the resident model, if any.
    pub async fn unload(&self) -> ApiResponse<CurrentModel> {
        let result = self
            .with_slot("unload", |slot| {
                slot.release();
                Ok(CurrentModel::default())
            })
            .await;
        Self::respond("unload", result)
    }

    pub fn current_model_info(&self) -> CurrentModel {
        self.snapshot.load().current.clone()
    }

    pub fn fused_adapters(&self) -> Vec<FusedAdapter> {
        self.snapshot.load().fused.clone()
    }

    pub fn encoder_cache_stats(&self) -> CacheStats {
        self.snapshot.load().cache
    }

    pub fn clip_skip(&self) -> usize {
        self.snapshot.load().clip_skip
    }

    pub fn list_models(&self) -> Vec<ModelListing> {
        let loaded = self.snapshot.load().current.key.clone();
        let is_loaded = |key: &str| loaded.as_deref() == Some(key);
        let cache_dir = self.config.models_dir.as_deref();

        let mut listings: Vec<ModelListing> = catalog::CATALOG
            .iter()
            .map(|entry| ModelListing {
                key: entry.key.to_string(),
                name: entry.name.to_string(),
                capability: entry.capabilities.first().copied(),
                capabilities: entry.capabilities.to_vec(),
                family: entry.family,
                loaded: is_loaded(entry.key),
                downloaded: entry.downloaded(cache_dir),
            })
            .collect();

        let mut custom: Vec<ModelListing> = self
            .custom_models
            .iter()
            .map(|model| ModelListing {
                key: model.id.clone(),
                name: model.name.clone(),
                capability: model.family.primary_capability(),
                capabilities: model.family.capabilities().to_vec(),
                family: model.family,
                loaded: is_loaded(&model.id),
                downloaded: model.path.is_file(),
            })
            .collect();
        custom.sort_by(|a, b| a.key.cmp(&b.key));
        listings.extend(custom);
        listings
    }

    pub fn detect_archive(&self, path: &Path) -> ArchiveInfo {
        sniffer::detect(path)
    }

    pub fn resource_info(&self) -> ResourceInfo {
        self.monitor.info()
    }

    pub fn reclaim(&self) {
        self.monitor.reclaim();
    }
}
