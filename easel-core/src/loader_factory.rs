use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use hf_hub::api::sync::{Api, ApiBuilder};
use tracing::{debug, info};

use crate::{device_label, ArchitectureFamily, DeviceMap, FluxLoader, LoadRequest, Loader, RuntimeHandle};

/// Loader backed by candle. Every handle lives on one device resolved at
/// construction time.
pub struct CandleLoader {
    device: Device,
    dtype: DType,
    cache_dir: Option<PathBuf>,
}

impl CandleLoader {
    pub fn new(device_map: DeviceMap, cache_dir: Option<PathBuf>) -> Result<Self> {
        let (device, dtype) = device_map.resolve()?;
        Ok(Self {
            device,
            dtype,
            cache_dir,
        })
    }

    fn api(&self) -> Result<Api> {
        let builder = match &self.cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()),
            None => ApiBuilder::from_env(),
        };
        builder.build().context("failed to build hub client")
    }
}

impl Loader for CandleLoader {
    fn load(&self, request: &LoadRequest) -> Result<RuntimeHandle> {
        info!(
            identity = %request.identity,
            family = %request.family,
            device = %device_label(&self.device),
            "loading model"
        );
        match request.family {
            ArchitectureFamily::Flux(_) => {
                FluxLoader::load(request, &self.api()?, &self.device, self.dtype)
            }
            family => bail!("{family} is recognized but not yet implemented by the candle runtime"),
        }
    }

    fn reclaim(&self) -> Result<()> {
        debug!(device = %device_label(&self.device), "synchronizing device");
        self.device.synchronize()?;
        Ok(())
    }
}
