use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DeviceMap, EaselError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hub cache directory. `None` uses the hub's own default.
    pub models_dir: Option<PathBuf>,
    pub outputs_dir: PathBuf,
    pub default_model: String,
    pub force_cpu: bool,
    pub device_ordinal: usize,
    pub default_width: usize,
    pub default_height: usize,
    pub default_steps: usize,
    pub default_guidance: f64,
    pub default_strength: f64,
    pub max_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: None,
            outputs_dir: PathBuf::from("outputs"),
            default_model: "flux-schnell".to_string(),
            force_cpu: false,
            device_ordinal: 0,
            default_width: 1024,
            default_height: 1024,
            default_steps: 30,
            default_guidance: 7.5,
            default_strength: 0.75,
            max_batch: 4,
        }
    }
}

fn parse<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| EaselError::InvalidInput(format!("{var} has an invalid value '{raw}'")))
}

fn parse_bool(var: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(EaselError::InvalidInput(format!("{var} has an invalid value '{raw}'"))),
    }
}

impl Config {
    /// Reads `EASEL_*` variables, loading a `.env` file first when present.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("loaded environment from {}", path.display()),
            Err(e) if e.not_found() => debug!("no .env file, using process environment"),
            Err(e) => warn!("failed to load .env file: {e}"),
        }
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = lookup("EASEL_MODELS_DIR") {
            config.models_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("EASEL_OUTPUTS_DIR") {
            config.outputs_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("EASEL_DEFAULT_MODEL") {
            config.default_model = model.trim().to_string();
        }
        if let Some(raw) = lookup("EASEL_FORCE_CPU") {
            config.force_cpu = parse_bool("EASEL_FORCE_CPU", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEVICE_ORDINAL") {
            config.device_ordinal = parse("EASEL_DEVICE_ORDINAL", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEFAULT_WIDTH") {
            config.default_width = parse("EASEL_DEFAULT_WIDTH", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEFAULT_HEIGHT") {
            config.default_height = parse("EASEL_DEFAULT_HEIGHT", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEFAULT_STEPS") {
            config.default_steps = parse("EASEL_DEFAULT_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEFAULT_GUIDANCE") {
            config.default_guidance = parse("EASEL_DEFAULT_GUIDANCE", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_DEFAULT_STRENGTH") {
            config.default_strength = parse("EASEL_DEFAULT_STRENGTH", &raw)?;
        }
        if let Some(raw) = lookup("EASEL_MAX_BATCH") {
            config.max_batch = parse("EASEL_MAX_BATCH", &raw)?;
        }
        if config.max_batch == 0 {
            return Err(EaselError::InvalidInput("EASEL_MAX_BATCH must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn device_map(&self) -> DeviceMap {
        if self.force_cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::Ordinal(self.device_ordinal)
        }
    }
}
