//! Architecture families, their capabilities and numeric precisions.
//!
//! Families form a closed set. Everything the orchestrator needs to know
//! about one (label, lineage, capabilities, text encoder slots) is carried
//! here as data rather than looked up by string elsewhere.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EaselError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FluxVariant {
    Schnell,
    Dev,
    Kontext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WanVersion {
    V2_1,
    V2_2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VideoDirection {
    TextToVideo,
    ImageToVideo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchitectureFamily {
    Sd15,
    Sdxl,
    SdxlTurbo,
    PonyXl,
    IllustriousXl,
    Flux(FluxVariant),
    Wan {
        version: WanVersion,
        direction: VideoDirection,
    },
    QwenImage,
    Unknown,
}

/// Base model lineage. Adapters trained against one lineage only fuse into
/// models of the same lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lineage {
    Sd15,
    Sdxl,
    Flux,
    Wan,
    Qwen,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextToImage,
    ImageToImage,
    TextToVideo,
    ImageToVideo,
    SpeechToVideo,
}

/// Text encoder position inside a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderSlot {
    Primary,
    Secondary,
}

const IMAGE: &[Capability] = &[Capability::TextToImage, Capability::ImageToImage];
const TEXT_ONLY: &[Capability] = &[Capability::TextToImage];
const T2V: &[Capability] = &[Capability::TextToVideo];
const I2V: &[Capability] = &[Capability::ImageToVideo];

const ONE_ENCODER: &[EncoderSlot] = &[EncoderSlot::Primary];
const TWO_ENCODERS: &[EncoderSlot] = &[EncoderSlot::Primary, EncoderSlot::Secondary];

impl ArchitectureFamily {
    pub const ALL: [ArchitectureFamily; 14] = [
        Self::Sd15,
        Self::Sdxl,
        Self::SdxlTurbo,
        Self::Flux(FluxVariant::Schnell),
        Self::Flux(FluxVariant::Dev),
        Self::Flux(FluxVariant::Kontext),
        Self::PonyXl,
        Self::IllustriousXl,
        Self::Wan {
            version: WanVersion::V2_1,
            direction: VideoDirection::TextToVideo,
        },
        Self::Wan {
            version: WanVersion::V2_1,
            direction: VideoDirection::ImageToVideo,
        },
        Self::Wan {
            version: WanVersion::V2_2,
            direction: VideoDirection::TextToVideo,
        },
        Self::Wan {
            version: WanVersion::V2_2,
            direction: VideoDirection::ImageToVideo,
        },
        Self::QwenImage,
        Self::Unknown,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Sd15 => "SD1.5",
            Self::Sdxl => "SDXL",
            Self::SdxlTurbo => "SDXL-Turbo",
            Self::PonyXl => "Pony Diffusion XL",
            Self::IllustriousXl => "Illustrious XL",
            Self::Flux(FluxVariant::Schnell) => "FLUX",
            Self::Flux(FluxVariant::Dev) => "FLUX.1 Dev",
            Self::Flux(FluxVariant::Kontext) => "FLUX.1 Kontext",
            Self::Wan { version, direction } => match (version, direction) {
                (WanVersion::V2_1, VideoDirection::TextToVideo) => "Wan 2.1 T2V",
                (WanVersion::V2_1, VideoDirection::ImageToVideo) => "Wan 2.1 I2V",
                (WanVersion::V2_2, VideoDirection::TextToVideo) => "Wan 2.2 T2V",
                (WanVersion::V2_2, VideoDirection::ImageToVideo) => "Wan 2.2 I2V",
            },
            Self::QwenImage => "Qwen-Image",
            Self::Unknown => "Unknown",
        }
    }

    pub fn lineage(&self) -> Lineage {
        match self {
            Self::Sd15 => Lineage::Sd15,
            Self::Sdxl | Self::SdxlTurbo | Self::PonyXl | Self::IllustriousXl => Lineage::Sdxl,
            Self::Flux(_) => Lineage::Flux,
            Self::Wan { .. } => Lineage::Wan,
            Self::QwenImage => Lineage::Qwen,
            Self::Unknown => Lineage::Unknown,
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Self::Sd15
            | Self::Sdxl
            | Self::SdxlTurbo
            | Self::PonyXl
            | Self::IllustriousXl
            | Self::Flux(_) => IMAGE,
            Self::Wan {
                direction: VideoDirection::TextToVideo,
                ..
            } => T2V,
            Self::Wan {
                direction: VideoDirection::ImageToVideo,
                ..
            } => I2V,
            Self::QwenImage => TEXT_ONLY,
            Self::Unknown => &[],
        }
    }

    pub fn encoder_slots(&self) -> &'static [EncoderSlot] {
        match self {
            Self::Sd15 | Self::Wan { .. } | Self::QwenImage => ONE_ENCODER,
            Self::Sdxl | Self::SdxlTurbo | Self::PonyXl | Self::IllustriousXl | Self::Flux(_) => {
                TWO_ENCODERS
            }
            Self::Unknown => &[],
        }
    }

    /// Whether loading this family also builds an image-to-image handle.
    pub fn supports_image_to_image(&self) -> bool {
        self.capabilities().contains(&Capability::ImageToImage)
    }

    /// The first capability, used as the headline capability in listings.
    pub fn primary_capability(&self) -> Option<Capability> {
        self.capabilities().first().copied()
    }

    /// An adapter targeting `target` may be fused into a model of this family.
    /// Adapters of unknown lineage are always attempted.
    pub fn accepts_adapter_for(&self, target: ArchitectureFamily) -> bool {
        target.lineage() == Lineage::Unknown || target.lineage() == self.lineage()
    }
}

impl fmt::Display for ArchitectureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ArchitectureFamily {
    type Err = EaselError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        if wanted.eq_ignore_ascii_case("FLUX.1 Schnell") {
            return Ok(Self::Flux(FluxVariant::Schnell));
        }
        Self::ALL
            .into_iter()
            .find(|family| family.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| EaselError::InvalidInput(format!("unknown architecture family '{s}'")))
    }
}

serde_plain::derive_serialize_from_display!(ArchitectureFamily);
serde_plain::derive_deserialize_from_fromstr!(ArchitectureFamily, "an architecture family label");

/// Numeric precision of stored or loaded weights.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Fp8,
    Other(String),
    Unknown,
}

impl Precision {
    pub fn from_dtype(dtype: safetensors::Dtype) -> Self {
        use safetensors::Dtype;
        match dtype {
            Dtype::F32 => Self::Fp32,
            Dtype::F16 => Self::Fp16,
            Dtype::BF16 => Self::Bf16,
            Dtype::F8_E4M3 | Dtype::F8_E5M2 => Self::Fp8,
            other => Self::Other(format!("{other:?}")),
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Self {
        use candle_core::DType;
        match dtype {
            DType::F32 => Self::Fp32,
            DType::F16 => Self::Fp16,
            DType::BF16 => Self::Bf16,
            other => Self::Other(other.as_str().to_string()),
        }
    }

    pub fn to_candle(&self) -> Option<candle_core::DType> {
        use candle_core::DType;
        match self {
            Self::Fp32 => Some(DType::F32),
            Self::Fp16 => Some(DType::F16),
            Self::Bf16 => Some(DType::BF16),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => f.write_str("FP32"),
            Self::Fp16 => f.write_str("FP16"),
            Self::Bf16 => f.write_str("BF16"),
            Self::Fp8 => f.write_str("FP8"),
            Self::Other(raw) => f.write_str(raw),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

impl FromStr for Precision {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "FP32" | "F32" => Self::Fp32,
            "FP16" | "F16" => Self::Fp16,
            "BF16" => Self::Bf16,
            "FP8" => Self::Fp8,
            "UNKNOWN" | "" => Self::Unknown,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

serde_plain::derive_serialize_from_display!(Precision);
serde_plain::derive_deserialize_from_fromstr!(Precision, "a precision label");
