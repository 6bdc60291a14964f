use std::path::Path;

use hf_hub::Cache;

use crate::{ArchitectureFamily, Capability, FluxVariant, ModelSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    pub key: &'static str,
    pub name: &'static str,
    pub repo: &'static str,
    pub weights_file: &'static str,
    pub capabilities: &'static [Capability],
    pub family: ArchitectureFamily,
}

const IMAGE: &[Capability] = &[Capability::TextToImage, Capability::ImageToImage];

pub static CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry {
        key: "flux-schnell",
        name: "FLUX.1 Schnell",
        repo: "black-forest-labs/FLUX.1-schnell",
        weights_file: "flux1-schnell.safetensors",
        capabilities: IMAGE,
        family: ArchitectureFamily::Flux(FluxVariant::Schnell),
    },
    ModelCatalogEntry {
        key: "flux-dev",
        name: "FLUX.1 Dev",
        repo: "black-forest-labs/FLUX.1-dev",
        weights_file: "flux1-dev.safetensors",
        capabilities: IMAGE,
        family: ArchitectureFamily::Flux(FluxVariant::Dev),
    },
    ModelCatalogEntry {
        key: "sd15",
        name: "Stable Diffusion 1.5",
        repo: "runwayml/stable-diffusion-v1-5",
        weights_file: "v1-5-pruned-emaonly.safetensors",
        capabilities: IMAGE,
        family: ArchitectureFamily::Sd15,
    },
    ModelCatalogEntry {
        key: "sdxl",
        name: "Stable Diffusion XL",
        repo: "stabilityai/stable-diffusion-xl-base-1.0",
        weights_file: "sd_xl_base_1.0.safetensors",
        capabilities: IMAGE,
        family: ArchitectureFamily::Sdxl,
    },
    ModelCatalogEntry {
        key: "sdxl-turbo",
        name: "SDXL Turbo",
        repo: "stabilityai/sdxl-turbo",
        weights_file: "sd_xl_turbo_1.0_fp16.safetensors",
        capabilities: IMAGE,
        family: ArchitectureFamily::SdxlTurbo,
    },
];

pub fn lookup(key: &str) -> Option<&'static ModelCatalogEntry> {
    CATALOG.iter().find(|entry| entry.key == key)
}

impl ModelCatalogEntry {
    pub fn source(&self) -> ModelSource {
        ModelSource::Hub {
            repo: self.repo.to_string(),
            weights_file: self.weights_file.to_string(),
        }
    }

    /// Whether the weights file is already in the local hub cache.
    pub fn downloaded(&self, cache_dir: Option<&Path>) -> bool {
        let cache = match cache_dir {
            Some(dir) => Cache::new(dir.to_path_buf()),
            None => Cache::default(),
        };
        cache
            .model(self.repo.to_string())
            .get(self.weights_file)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_families_agree_with_capabilities() {
        for (i, entry) in CATALOG.iter().enumerate() {
            assert!(CATALOG[i + 1..].iter().all(|other| other.key != entry.key));
            assert_eq!(entry.capabilities, entry.family.capabilities());
        }
        assert_eq!(lookup("sdxl").map(|e| e.family), Some(ArchitectureFamily::Sdxl));
        assert!(lookup("midjourney").is_none());
    }

    #[test]
    fn empty_cache_reports_nothing_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CATALOG.iter().all(|entry| !entry.downloaded(Some(dir.path()))));
    }
}
