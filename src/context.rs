//! Device and dtype selection, passed explicitly to every constructor.

use candle_core::{DType, Device};

use crate::Result;

/// Where and in which precision tensors are created.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub device: Device,
    pub dtype: DType,
}

impl ExecutionContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// CPU, f32.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// First CUDA device when compiled with `cuda` and one is present,
    /// CPU otherwise. Always f32.
    pub fn best_available() -> Result<Self> {
        Ok(Self::new(Device::cuda_if_available(0)?, DType::F32))
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self.device, Device::Cpu)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}
