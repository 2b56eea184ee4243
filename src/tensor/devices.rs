//! Device identifiers carried by tensor metadata

use std::fmt::{self, Display};
use std::str::FromStr;
use serde::{Serialize, Deserialize};

use crate::error::AnvilError;

/// Where a tensor value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
    Vulkan(usize),
    OpenCL(usize),
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            Device::Metal(id) => write!(f, "metal:{}", id),
            Device::Vulkan(id) => write!(f, "vulkan:{}", id),
            Device::OpenCL(id) => write!(f, "opencl:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = AnvilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        let (kind, index) = s
            .split_once(':')
            .ok_or_else(|| AnvilError::DeviceError(format!("Unrecognized device '{}'", s)))?;
        let index: usize = index
            .parse()
            .map_err(|_| AnvilError::DeviceError(format!("Bad device index in '{}'", s)))?;
        match kind {
            "cuda" => Ok(Device::Cuda(index)),
            "metal" => Ok(Device::Metal(index)),
            "vulkan" => Ok(Device::Vulkan(index)),
            "opencl" => Ok(Device::OpenCL(index)),
            _ => Err(AnvilError::DeviceError(format!("Unrecognized device '{}'", s))),
        }
    }
}
