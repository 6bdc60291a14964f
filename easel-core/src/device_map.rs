use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::{info, warn};

/// Which device the runtime slot lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    /// Resolves to a concrete device and the dtype weights are loaded at.
    pub fn resolve(self) -> Result<(Device, DType)> {
        let device = select_best_device(self)?;
        let dtype = device.bf16_default_to_f32();
        info!(device = %device_label(&device), ?dtype, "resolved runtime device");
        Ok((device, dtype))
    }

    pub fn ordinal(self) -> Option<usize> {
        match self {
            Self::ForceCpu => None,
            Self::Ordinal(ordinal) => Some(ordinal),
        }
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, build with `--features metal` to run on the GPU");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, build with `--features cuda` to run on the GPU");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Short label such as `cuda:0`, `metal:0` or `cpu`.
pub fn device_label(device: &Device) -> String {
    match device.location() {
        candle_core::DeviceLocation::Cpu => "cpu".to_string(),
        candle_core::DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        candle_core::DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}
