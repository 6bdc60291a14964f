//! Header-only classification of `.safetensors` archives.
//!
//! The file is memory mapped and only the JSON header is parsed. Tensor
//! payload pages are never touched.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{ArchitectureFamily, FluxVariant, Precision, VideoDirection, WanVersion};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub family: ArchitectureFamily,
    pub precision: Precision,
}

impl ArchiveInfo {
    pub fn unknown() -> Self {
        Self {
            family: ArchitectureFamily::Unknown,
            precision: Precision::Unknown,
        }
    }
}

/// Classifies the archive at `path`. Never fails: anything unreadable is
/// reported as unknown.
pub fn detect(path: &Path) -> ArchiveInfo {
    let is_safetensors = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
    if !is_safetensors {
        debug!(path = %path.display(), "not a .safetensors archive");
        return ArchiveInfo::unknown();
    }
    match read_header(path) {
        Ok(info) => {
            info!(path = %path.display(), family = %info.family, precision = %info.precision, "classified archive");
            info
        }
        Err(e) => {
            warn!(path = %path.display(), "failed to read archive header: {e:#}");
            ArchiveInfo::unknown()
        }
    }
}

fn read_header(path: &Path) -> Result<ArchiveInfo> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { MmapOptions::new().map(&file) }.context("failed to map archive")?;
    let (_, metadata) = SafeTensors::read_metadata(&mmap).context("invalid safetensors header")?;

    let tensors = metadata.tensors();
    let precision = tensors
        .values()
        .min_by_key(|info| info.data_offsets.0)
        .map(|info| Precision::from_dtype(info.dtype))
        .unwrap_or(Precision::Unknown);
    let keys: Vec<&str> = tensors.keys().map(String::as_str).collect();
    let family = classify(&keys, metadata.metadata().as_ref());
    Ok(ArchiveInfo { family, precision })
}

fn any_key_contains(keys: &[&str], needles: &[&str]) -> bool {
    keys.iter()
        .any(|key| needles.iter().any(|needle| key.contains(needle)))
}

/// Applies the ordered classification rules to a key set. The first rule
/// that matches wins.
pub fn classify(keys: &[&str], metadata: Option<&HashMap<String, String>>) -> ArchitectureFamily {
    let meta = metadata
        .map(|m| {
            m.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .unwrap_or_default();
    let lower_keys: Vec<String> = keys.iter().map(|k| k.to_lowercase()).collect();
    let lower_keys: Vec<&str> = lower_keys.iter().map(String::as_str).collect();

    if any_key_contains(keys, &["double_blocks", "single_blocks", "img_in", "txt_in"]) {
        let variant = if any_key_contains(&lower_keys, &["kontext"]) || meta.contains("kontext") {
            FluxVariant::Kontext
        } else if any_key_contains(keys, &["guidance_in"])
            || ["flux.1-dev", "flux1-dev", "flux-dev", "flux.1 dev"]
                .iter()
                .any(|marker| meta.contains(marker))
        {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        };
        return ArchitectureFamily::Flux(variant);
    }

    if any_key_contains(keys, &["conditioner.embedders", "label_emb", "add_embedding"]) {
        return if meta.contains("pony") {
            ArchitectureFamily::PonyXl
        } else if meta.contains("illustrious") {
            ArchitectureFamily::IllustriousXl
        } else if meta.contains("turbo") {
            ArchitectureFamily::SdxlTurbo
        } else {
            ArchitectureFamily::Sdxl
        };
    }

    if any_key_contains(keys, &["model.diffusion_model.input_blocks"]) {
        return if any_key_contains(keys, &["model.diffusion_model.input_blocks.11."]) {
            ArchitectureFamily::Sdxl
        } else {
            ArchitectureFamily::Sd15
        };
    }

    // Video markers alone are not enough, a direction marker is required.
    if any_key_contains(&lower_keys, &["temporal", "video", "frame"]) {
        let direction = if any_key_contains(&lower_keys, &["i2v", "img_emb"]) {
            Some(VideoDirection::ImageToVideo)
        } else if any_key_contains(&lower_keys, &["t2v"]) {
            Some(VideoDirection::TextToVideo)
        } else {
            None
        };
        if let Some(direction) = direction {
            let version = if meta.contains("2.2") {
                WanVersion::V2_2
            } else {
                WanVersion::V2_1
            };
            return ArchitectureFamily::Wan { version, direction };
        }
    }

    if any_key_contains(&lower_keys, &["qwen", "text_encoder"]) {
        return ArchitectureFamily::QwenImage;
    }

    ArchitectureFamily::Unknown
}
