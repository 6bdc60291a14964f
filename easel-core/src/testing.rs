//! In-process stand-ins for the numeric runtime, used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::{
    catalog, AdapterMechanism, AdapterSpec, ArchitectureFamily, EncoderSlot, FluxVariant,
    LoadRequest, Loader, Pipeline, PipelineRequest, Precision, RuntimeHandle, SchedulerChoice,
    SharedEncoder, Task, TextEncoder,
};

pub(crate) const PRIMARY_LAYERS: usize = 12;
pub(crate) const SECONDARY_LAYERS: usize = 24;

#[derive(Default)]
struct Inner {
    loads: AtomicUsize,
    reclaims: AtomicUsize,
    encoder_builds: AtomicUsize,
    forward_passes: AtomicUsize,
    unfuses: AtomicUsize,
    max_live: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live: Mutex<Vec<String>>,
    schedulers: Mutex<Vec<SchedulerChoice>>,
    last_request: Mutex<Option<(Task, usize, usize, usize)>>,
}

/// Shared counters observed by tests.
#[derive(Clone, Default)]
pub(crate) struct MockCounters(Arc<Inner>);

impl MockCounters {
    pub fn loads(&self) -> usize {
        self.0.loads.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> usize {
        self.0.reclaims.load(Ordering::SeqCst)
    }

    pub fn encoder_builds(&self) -> usize {
        self.0.encoder_builds.load(Ordering::SeqCst)
    }

    pub fn forward_passes(&self) -> usize {
        self.0.forward_passes.load(Ordering::SeqCst)
    }

    pub fn unfuses(&self) -> usize {
        self.0.unfuses.load(Ordering::SeqCst)
    }

    /// Adapters currently fused into the text-to-image pipeline.
    pub fn live_adapters(&self) -> Vec<String> {
        self.0.live.lock().unwrap().clone()
    }

    /// The most forward passes ever observed running at once.
    pub fn max_concurrent_generations(&self) -> usize {
        self.0.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_live_adapters(&self) -> usize {
        self.0.max_live.load(Ordering::SeqCst)
    }

    pub fn schedulers(&self) -> Vec<SchedulerChoice> {
        self.0.schedulers.lock().unwrap().clone()
    }

    /// (task, width, height, strength in percent) of the last forward pass.
    pub fn last_request(&self) -> Option<(Task, usize, usize, usize)> {
        *self.0.last_request.lock().unwrap()
    }

    fn publish_live(&self, names: &[String]) {
        self.0.max_live.fetch_max(names.len(), Ordering::SeqCst);
        *self.0.live.lock().unwrap() = names.to_vec();
    }
}

pub(crate) struct MockEncoder {
    layers: usize,
}

impl TextEncoder for MockEncoder {
    fn num_layers(&self) -> usize {
        self.layers
    }

    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        Ok(input_ids.clone())
    }
}

/// A pipeline that records what is done to it. Adapters whose name contains
/// `broken` are rejected, prompts equal to `panic` panic.
pub(crate) struct MockPipeline {
    task: Task,
    slots: Vec<EncoderSlot>,
    encoders: HashMap<EncoderSlot, SharedEncoder>,
    mechanism: AdapterMechanism,
    pending: Vec<String>,
    fused: Vec<String>,
    counters: MockCounters,
}

impl MockPipeline {
    fn new(task: Task, family: ArchitectureFamily, counters: &MockCounters) -> Self {
        let slots = family.encoder_slots().to_vec();
        let encoders = slots
            .iter()
            .map(|&slot| {
                let layers = match slot {
                    EncoderSlot::Primary => PRIMARY_LAYERS,
                    EncoderSlot::Secondary => SECONDARY_LAYERS,
                };
                (slot, Arc::new(MockEncoder { layers }) as SharedEncoder)
            })
            .collect();
        let mechanism = match task {
            Task::TextToImage => AdapterMechanism::Staged,
            Task::ImageToImage => AdapterMechanism::Direct,
        };
        Self {
            task,
            slots,
            encoders,
            mechanism,
            pending: Vec::new(),
            fused: Vec::new(),
            counters: counters.clone(),
        }
    }

    fn sync_live(&self) {
        if self.task == Task::TextToImage {
            self.counters.publish_live(&self.fused);
        }
    }
}

impl Pipeline for MockPipeline {
    fn task(&self) -> Task {
        self.task
    }

    fn generate(&mut self, request: &PipelineRequest) -> Result<Vec<DynamicImage>> {
        if request.prompt == "panic" {
            panic!("mock runtime blew up");
        }
        self.counters.0.forward_passes.fetch_add(1, Ordering::SeqCst);
        let running = self.counters.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.0.max_in_flight.fetch_max(running, Ordering::SeqCst);
        // Long enough for overlapping callers to collide if nothing serializes them.
        std::thread::sleep(Duration::from_millis(20));
        self.counters.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        let strength = request
            .init
            .as_ref()
            .map(|init| (init.strength * 100.0).round() as usize)
            .unwrap_or(0);
        *self.counters.0.last_request.lock().unwrap() =
            Some((self.task, request.width, request.height, strength));
        Ok((0..request.num_images)
            .map(|_| DynamicImage::new_rgb8(request.width as u32, request.height as u32))
            .collect())
    }

    fn encoder_slots(&self) -> &[EncoderSlot] {
        &self.slots
    }

    fn text_encoder(&self, slot: EncoderSlot) -> Option<SharedEncoder> {
        self.encoders.get(&slot).cloned()
    }

    fn replace_text_encoder(&mut self, slot: EncoderSlot, encoder: SharedEncoder) -> Result<()> {
        if !self.slots.contains(&slot) {
            bail!("no encoder in slot {slot:?}");
        }
        self.encoders.insert(slot, encoder);
        Ok(())
    }

    fn build_truncated_encoder(&self, _slot: EncoderSlot, layers: usize) -> Result<SharedEncoder> {
        self.counters.0.encoder_builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockEncoder { layers }))
    }

    fn adapter_mechanism(&self) -> AdapterMechanism {
        self.mechanism
    }

    fn stage_adapter(&mut self, adapter: &AdapterSpec) -> Result<()> {
        if adapter.name.contains("broken") {
            bail!("tensor shape mismatch in '{}'", adapter.name);
        }
        self.pending.push(adapter.name.clone());
        Ok(())
    }

    fn commit_adapters(&mut self) -> Result<()> {
        self.fused = std::mem::take(&mut self.pending);
        self.sync_live();
        Ok(())
    }

    fn fuse_adapter(&mut self, adapter: &AdapterSpec) -> Result<()> {
        if adapter.name.contains("broken") {
            bail!("tensor shape mismatch in '{}'", adapter.name);
        }
        self.fused.push(adapter.name.clone());
        self.sync_live();
        Ok(())
    }

    fn unfuse_adapters(&mut self) -> Result<()> {
        self.counters.0.unfuses.fetch_add(1, Ordering::SeqCst);
        self.pending.clear();
        self.fused.clear();
        self.sync_live();
        Ok(())
    }

    fn supports_scheduler(&self, choice: SchedulerChoice) -> bool {
        choice != SchedulerChoice::Lms
    }

    fn set_scheduler(&mut self, choice: SchedulerChoice) -> Result<()> {
        self.counters.0.schedulers.lock().unwrap().push(choice);
        Ok(())
    }
}

fn build_handle(identity: &str, family: ArchitectureFamily, counters: &MockCounters) -> RuntimeHandle {
    RuntimeHandle {
        identity: identity.to_string(),
        family,
        text_to_image: Box::new(MockPipeline::new(Task::TextToImage, family, counters)),
        image_to_image: family
            .supports_image_to_image()
            .then(|| Box::new(MockPipeline::new(Task::ImageToImage, family, counters)) as Box<dyn Pipeline>),
        device: Device::Cpu,
        precision: Precision::Fp32,
    }
}

/// A handle for a catalog key, or a FLUX handle for anything else.
pub(crate) fn mock_handle(identity: &str, counters: &MockCounters) -> RuntimeHandle {
    let family = catalog::lookup(identity)
        .map(|entry| entry.family)
        .unwrap_or(ArchitectureFamily::Flux(FluxVariant::Schnell));
    build_handle(identity, family, counters)
}

#[derive(Default)]
pub(crate) struct MockLoader {
    counters: MockCounters,
    unreachable: Vec<String>,
}

impl MockLoader {
    /// A loader that fails for the given identities, as if their weights
    /// could not be fetched.
    pub fn unreachable(identities: &[&str]) -> Self {
        Self {
            counters: MockCounters::default(),
            unreachable: identities.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }
}

impl Loader for MockLoader {
    fn load(&self, request: &LoadRequest) -> Result<RuntimeHandle> {
        if self.unreachable.contains(&request.identity) {
            bail!("failed to fetch weights for {}: connection refused", request.identity);
        }
        self.counters.0.loads.fetch_add(1, Ordering::SeqCst);
        Ok(build_handle(&request.identity, request.family, &self.counters))
    }

    fn reclaim(&self) -> Result<()> {
        self.counters.0.reclaims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
