use std::sync::Arc;

use candle_core::utils::cuda_is_available;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DeviceMap, Loader};

const GIB: f64 = (1u64 << 30) as f64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_gb: f64,
    pub allocated_gb: f64,
    pub reserved_gb: f64,
    pub free_gb: f64,
    pub utilization_percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub available: bool,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResourceInfo {
    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            available: false,
            device: "cpu".to_string(),
            name: None,
            memory: None,
            compute_capability: None,
            message: Some(message.into()),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Reports accelerator state through NVML and forwards reclaim requests to
/// the runtime loader.
pub struct ResourceMonitor {
    nvml: Option<Nvml>,
    ordinal: Option<u32>,
    loader: Arc<dyn Loader>,
}

impl ResourceMonitor {
    pub fn new(device_map: DeviceMap, loader: Arc<dyn Loader>) -> Self {
        let ordinal = device_map.ordinal().map(|o| o as u32);
        let nvml = match ordinal {
            Some(_) if cuda_is_available() => match Nvml::init() {
                Ok(nvml) => Some(nvml),
                Err(e) => {
                    warn!("failed to initialize NVML, memory stats unavailable: {e}");
                    None
                }
            },
            _ => None,
        };
        Self {
            nvml,
            ordinal,
            loader,
        }
    }

    pub fn has_accelerator(&self) -> bool {
        self.nvml.is_some()
    }

    /// Snapshot of accelerator state. Never fails.
    pub fn info(&self) -> ResourceInfo {
        let (Some(nvml), Some(ordinal)) = (&self.nvml, self.ordinal) else {
            return ResourceInfo::unavailable("No CUDA GPU detected");
        };
        let device = match nvml.device_by_index(ordinal) {
            Ok(device) => device,
            Err(e) => {
                warn!(ordinal, "failed to query GPU: {e}");
                return ResourceInfo {
                    message: Some(format!("failed to query GPU {ordinal}: {e}")),
                    ..ResourceInfo::unavailable("")
                };
            }
        };

        let name = device.name().ok();
        let compute_capability = device
            .cuda_compute_capability()
            .ok()
            .map(|cc| format!("{}.{}", cc.major, cc.minor));
        let memory = match device.memory_info() {
            Ok(mem) => {
                let pid = std::process::id();
                let allocated: u64 = device
                    .running_compute_processes()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|p| p.pid == pid)
                    .map(|p| match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => bytes,
                        UsedGpuMemory::Unavailable => 0,
                    })
                    .sum();
                let total = mem.total as f64;
                let allocated = allocated as f64;
                Some(MemoryStats {
                    total_gb: round_to(total / GIB, 2),
                    allocated_gb: round_to(allocated / GIB, 2),
                    reserved_gb: round_to(mem.used as f64 / GIB, 2),
                    free_gb: round_to((total - allocated) / GIB, 2),
                    utilization_percent: if total > 0.0 {
                        round_to(allocated / total * 100.0, 1)
                    } else {
                        0.0
                    },
                })
            }
            Err(e) => {
                warn!(ordinal, "failed to read GPU memory info: {e}");
                None
            }
        };

        ResourceInfo {
            available: true,
            device: format!("cuda:{ordinal}"),
            name,
            memory,
            compute_capability,
            message: None,
        }
    }

    /// Asks the runtime to release cached memory. Safe to call repeatedly,
    /// a no-op without an accelerator.
    pub fn reclaim(&self) {
        if !self.has_accelerator() {
            debug!("no accelerator, skipping reclaim");
            return;
        }
        match self.loader.reclaim() {
            Ok(()) => info!("GPU cache cleared"),
            Err(e) => warn!("memory reclaim failed: {e:#}"),
        }
    }
}
