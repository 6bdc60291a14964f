use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{self, ClipTextConfig, ClipTextTransformer},
    t5::{self, T5EncoderModel},
};

use crate::TextEncoder;

pub(crate) const CLIP_LAYERS: usize = 12;

fn clip_config(num_hidden_layers: usize) -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers,
        num_attention_heads: 12,
    }
}

/// CLIP ViT-L/14 text tower, producing the pooled prompt vector.
pub(crate) struct ClipEncoder {
    model: ClipTextTransformer,
    layers: usize,
}

impl ClipEncoder {
    pub fn load(weights: &Path, layers: usize, dtype: DType, device: &Device) -> Result<Self> {
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let model = ClipTextTransformer::new(vb.pp("text_model"), &clip_config(layers))
            .context("failed to load CLIP model")?;
        Ok(Self { model, layers })
    }
}

impl TextEncoder for ClipEncoder {
    fn num_layers(&self) -> usize {
        self.layers
    }

    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.model.forward(input_ids)
    }
}

/// T5 v1.1 XXL encoder. Its forward pass needs `&mut`, hence the mutex.
pub(crate) struct T5Encoder {
    model: Mutex<T5EncoderModel>,
    layers: usize,
}

impl T5Encoder {
    pub fn load(
        weights: &Path,
        config: &t5::Config,
        layers: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)
                .context("failed to build T5 var builder")?
        };
        let mut config = config.clone();
        config.num_layers = layers;
        let model = T5EncoderModel::load(vb, &config).context("failed to load T5 model")?;
        Ok(Self {
            model: Mutex::new(model),
            layers,
        })
    }
}

impl TextEncoder for T5Encoder {
    fn num_layers(&self) -> usize {
        self.layers
    }

    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| candle_core::Error::msg("T5 encoder lock poisoned"))?;
        model.forward(input_ids)
    }
}
