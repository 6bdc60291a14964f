use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{EaselError, EncoderSlot, Result, RuntimeHandle, SharedEncoder, Task};

type CacheKey = (String, usize, EncoderSlot);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Depth-truncated text encoders for the loaded model.
///
/// A skip depth `d >= 1` keeps `layers - (d - 1)` transformer layers, so
/// depth 1 keeps the full stack just like depth 0. Entries are keyed by model
/// identity, depth and slot and are dropped wholesale whenever the base model
/// changes.
#[derive(Default)]
pub struct EncoderCache {
    identity: Option<String>,
    entries: HashMap<CacheKey, SharedEncoder>,
    originals: HashMap<(Task, EncoderSlot), SharedEncoder>,
    current_depth: usize,
    hits: u64,
    misses: u64,
}

impl EncoderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every cached encoder and backed up original.
    pub fn reset(&mut self) {
        if !self.entries.is_empty() || !self.originals.is_empty() {
            debug!(entries = self.entries.len(), "clearing encoder cache");
        }
        *self = Self::default();
    }

    pub fn current_depth(&self) -> usize {
        self.current_depth
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }

    pub fn apply_depth(&mut self, handle: &mut RuntimeHandle, depth: usize) -> Result<()> {
        if self.identity.as_deref() != Some(handle.identity.as_str()) {
            self.reset();
            self.identity = Some(handle.identity.clone());
        }
        if depth == 0 {
            self.restore(handle)?;
            self.current_depth = 0;
            return Ok(());
        }

        if self.originals.is_empty() {
            for pipeline in handle.pipelines_mut() {
                let task = pipeline.task();
                for &slot in pipeline.encoder_slots() {
                    if let Some(encoder) = pipeline.text_encoder(slot) {
                        self.originals.insert((task, slot), encoder);
                    }
                }
            }
        }

        let slots: Vec<EncoderSlot> = handle.text_to_image.encoder_slots().to_vec();
        for &slot in &slots {
            if let Some(original) = self.originals.get(&(Task::TextToImage, slot)) {
                let layers = original.num_layers();
                if depth - 1 >= layers {
                    return Err(EaselError::InvalidDepth { depth, layers });
                }
            }
        }

        let mut resolved = Vec::with_capacity(slots.len());
        for slot in slots {
            let Some(original_layers) = self
                .originals
                .get(&(Task::TextToImage, slot))
                .map(|encoder| encoder.num_layers())
            else {
                continue;
            };
            let key = (handle.identity.clone(), depth, slot);
            let encoder = match self.entries.get(&key) {
                Some(encoder) => {
                    self.hits += 1;
                    debug!(identity = %handle.identity, depth, ?slot, "encoder cache hit");
                    encoder.clone()
                }
                None => {
                    self.misses += 1;
                    let layers = original_layers - (depth - 1);
                    info!(identity = %handle.identity, depth, ?slot, layers, "building truncated text encoder");
                    let encoder = handle
                        .text_to_image
                        .build_truncated_encoder(slot, layers)
                        .map_err(EaselError::runtime)?;
                    self.entries.insert(key, encoder.clone());
                    encoder
                }
            };
            resolved.push((slot, encoder));
        }

        for pipeline in handle.pipelines_mut() {
            for (slot, encoder) in &resolved {
                if pipeline.encoder_slots().contains(slot) {
                    pipeline
                        .replace_text_encoder(*slot, encoder.clone())
                        .map_err(EaselError::runtime)?;
                }
            }
        }
        self.current_depth = depth;
        Ok(())
    }

    fn restore(&mut self, handle: &mut RuntimeHandle) -> Result<()> {
        if self.originals.is_empty() {
            return Ok(());
        }
        for pipeline in handle.pipelines_mut() {
            let task = pipeline.task();
            let slots: Vec<EncoderSlot> = pipeline.encoder_slots().to_vec();
            for slot in slots {
                if let Some(original) = self.originals.get(&(task, slot)) {
                    pipeline
                        .replace_text_encoder(slot, original.clone())
                        .map_err(EaselError::runtime)?;
                }
            }
        }
        if self.current_depth != 0 {
            debug!(identity = ?self.identity, "restored original text encoders");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{mock_handle, MockCounters};

    fn encoder_ptr(handle: &mut RuntimeHandle, task: Task, slot: EncoderSlot) -> *const () {
        let pipeline = handle.pipeline_mut(task).unwrap();
        Arc::as_ptr(&pipeline.text_encoder(slot).unwrap()) as *const ()
    }

    #[test]
    fn depth_then_zero_restores_the_same_encoder() {
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let original = encoder_ptr(&mut handle, Task::TextToImage, EncoderSlot::Primary);
        let original_i2i = encoder_ptr(&mut handle, Task::ImageToImage, EncoderSlot::Secondary);
        let mut cache = EncoderCache::new();

        for depth in 2..=4 {
            cache.apply_depth(&mut handle, depth).unwrap();
            assert_ne!(encoder_ptr(&mut handle, Task::TextToImage, EncoderSlot::Primary), original);
            cache.apply_depth(&mut handle, 0).unwrap();
            assert_eq!(encoder_ptr(&mut handle, Task::TextToImage, EncoderSlot::Primary), original);
            assert_eq!(
                encoder_ptr(&mut handle, Task::ImageToImage, EncoderSlot::Secondary),
                original_i2i
            );
        }
        assert_eq!(cache.current_depth(), 0);
    }

    #[test]
    fn same_depth_twice_builds_once() {
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let mut cache = EncoderCache::new();

        cache.apply_depth(&mut handle, 2).unwrap();
        let builds = counters.encoder_builds();
        cache.apply_depth(&mut handle, 2).unwrap();

        assert_eq!(counters.encoder_builds(), builds);
        // one build and one hit per slot
        assert_eq!(builds, 2);
        assert_eq!(cache.stats(), CacheStats { hits: 2, misses: 2, entries: 2 });
        let layers = handle.text_to_image.text_encoder(EncoderSlot::Primary).unwrap().num_layers();
        assert_eq!(layers, 11);
    }

    #[test]
    fn depth_one_keeps_every_layer() {
        let counters = MockCounters::default();
        let mut handle = mock_handle("sdxl", &counters);
        let mut cache = EncoderCache::new();
        cache.apply_depth(&mut handle, 1).unwrap();
        let primary = handle.text_to_image.text_encoder(EncoderSlot::Primary).unwrap();
        assert_eq!(primary.num_layers(), 12);
    }

    #[test]
    fn too_deep_is_rejected_before_anything_is_built() {
        let counters = MockCounters::default();
        let mut handle = mock_handle("flux-schnell", &counters);
        let mut cache = EncoderCache::new();
        let err = cache.apply_depth(&mut handle, 13).unwrap_err();
        assert!(matches!(err, EaselError::InvalidDepth { depth: 13, layers: 12 }));
        assert_eq!(counters.encoder_builds(), 0);
        assert_eq!(cache.current_depth(), 0);
    }

    #[test]
    fn new_identity_invalidates_entries() {
        let counters = MockCounters::default();
        let mut cache = EncoderCache::new();
        let mut first = mock_handle("flux-schnell", &counters);
        cache.apply_depth(&mut first, 3).unwrap();
        let mut second = mock_handle("flux-dev", &counters);
        cache.apply_depth(&mut second, 3).unwrap();
        assert_eq!(counters.encoder_builds(), 4);
        assert_eq!(cache.stats().entries, 2);
        assert_eq!(cache.stats().hits, 0);
    }
}
