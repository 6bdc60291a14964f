//! LoRA archives for the FLUX transformer.
//!
//! Kohya (`lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight`) and
//! PEFT style keys named after the original transformer modules
//! (`diffusion_model.double_blocks.0.img_attn.qkv.lora_A.weight`) are
//! understood. Each low-rank pair becomes a dense delta
//! `up @ down * weight * alpha / rank` keyed by the base weight it modifies.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

const STEM_PREFIXES: &[&str] = &[
    "lora_unet_",
    "base_model.model.",
    "diffusion_model.",
    "transformer.",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

fn split_key(key: &str) -> Option<(&str, Part)> {
    const SUFFIXES: &[(&str, Part)] = &[
        (".lora_down.weight", Part::Down),
        (".lora_up.weight", Part::Up),
        (".lora_A.weight", Part::Down),
        (".lora_B.weight", Part::Up),
        (".alpha", Part::Alpha),
    ];
    SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|stem| (stem, *part)))
}

fn normalize(stem: &str) -> String {
    let mut stem = stem;
    for prefix in STEM_PREFIXES {
        if let Some(rest) = stem.strip_prefix(prefix) {
            stem = rest;
        }
    }
    stem.replace('.', "_")
}

#[derive(Default)]
struct LowRank {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Reads the adapter at `path` and computes one dense delta per base weight.
pub(crate) fn load_deltas(
    path: &Path,
    weight: f64,
    base: &HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("failed to read adapter {}", path.display()))?;

    let mut groups: HashMap<String, LowRank> = HashMap::new();
    for (key, tensor) in tensors {
        let Some((stem, part)) = split_key(&key) else {
            continue;
        };
        let group = groups.entry(normalize(stem)).or_default();
        match part {
            Part::Down => group.down = Some(tensor),
            Part::Up => group.up = Some(tensor),
            Part::Alpha => {
                group.alpha = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .map(|a| *a as f64)
            }
        }
    }

    let index: HashMap<String, &String> = base
        .keys()
        .filter_map(|key| key.strip_suffix(".weight").map(|stem| (stem.replace('.', "_"), key)))
        .collect();

    let mut deltas: HashMap<String, Tensor> = HashMap::new();
    let mut unmatched = 0usize;
    for (stem, group) in groups {
        let (Some(down), Some(up)) = (group.down, group.up) else {
            debug!(stem, "incomplete low-rank pair, skipping");
            continue;
        };
        let Some(base_key) = index.get(&stem).copied() else {
            unmatched += 1;
            continue;
        };
        if down.rank() != 2 || up.rank() != 2 {
            bail!("adapter module {stem} is not a linear layer");
        }
        let rank = down.dim(0)?;
        let alpha = group.alpha.unwrap_or(rank as f64);
        let scale = weight * alpha / rank as f64;
        let delta = up
            .to_dtype(DType::F32)?
            .matmul(&down.to_dtype(DType::F32)?)?
            .affine(scale, 0.0)?;
        let target = &base[base_key];
        if delta.dims() != target.dims() {
            bail!(
                "adapter module {stem} produces a {:?} delta but {base_key} is {:?}",
                delta.dims(),
                target.dims()
            );
        }
        let delta = delta.to_dtype(dtype)?;
        let delta = match deltas.remove(base_key) {
            Some(previous) => (previous + delta)?,
            None => delta,
        };
        deltas.insert(base_key.clone(), delta);
    }

    if deltas.is_empty() {
        bail!(
            "no tensors in {} match the loaded transformer",
            path.display()
        );
    }
    if unmatched > 0 {
        warn!(
            adapter = %path.display(),
            unmatched, "some adapter modules have no counterpart in the transformer"
        );
    }
    Ok(deltas)
}

/// Base weights with every delta added on top.
pub(crate) fn merge(
    base: &HashMap<String, Tensor>,
    staged: &[&HashMap<String, Tensor>],
) -> Result<HashMap<String, Tensor>> {
    let mut merged = base.clone();
    for deltas in staged {
        for (key, delta) in deltas.iter() {
            let current = merged
                .get(key)
                .with_context(|| format!("no base weight named {key}"))?;
            let updated = (current + delta)?;
            merged.insert(key.clone(), updated);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QKV: &str = "double_blocks.0.img_attn.qkv.weight";

    fn base() -> HashMap<String, Tensor> {
        let mut base = HashMap::new();
        base.insert(
            QKV.to_string(),
            Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        base.insert(
            "img_in.bias".to_string(),
            Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
        );
        base
    }

    fn write_lora(dir: &Path, prefix: &str, down_name: &str, up_name: &str, up_rows: usize) -> std::path::PathBuf {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            format!("{prefix}.{down_name}.weight"),
            Tensor::ones((2, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            format!("{prefix}.{up_name}.weight"),
            Tensor::ones((up_rows, 2), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            format!("{prefix}.alpha"),
            Tensor::new(&[1f32], &device).unwrap(),
        );
        let path = dir.join(format!("{down_name}-{up_rows}.safetensors"));
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    #[test]
    fn kohya_keys_become_scaled_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lora(dir.path(), "lora_unet_double_blocks_0_img_attn_qkv", "lora_down", "lora_up", 4);
        let deltas = load_deltas(&path, 0.5, &base(), DType::F32, &Device::Cpu).unwrap();
        let delta = &deltas[QKV];
        // ones(4,2) @ ones(2,3) = 2 everywhere, times 0.5 * alpha 1 / rank 2
        let values = delta.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 0.5).abs() < 1e-6));

        let merged = merge(&base(), &[&deltas, &deltas]).unwrap();
        let values = merged[QKV].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn peft_keys_with_module_names_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lora(dir.path(), "diffusion_model.double_blocks.0.img_attn.qkv", "lora_A", "lora_B", 4);
        let deltas = load_deltas(&path, 1.0, &base(), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[QKV].dims(), &[4, 3]);
    }

    #[test]
    fn shape_mismatch_and_foreign_adapters_fail() {
        let dir = tempfile::tempdir().unwrap();
        let wrong = write_lora(dir.path(), "lora_unet_double_blocks_0_img_attn_qkv", "lora_down", "lora_up", 5);
        assert!(load_deltas(&wrong, 1.0, &base(), DType::F32, &Device::Cpu).is_err());

        let foreign = write_lora(dir.path(), "lora_unet_down_blocks_0_attentions_0_proj_in", "lora_down", "lora_up", 4);
        let err = load_deltas(&foreign, 1.0, &base(), DType::F32, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("match the loaded transformer"));
    }
}
