//! Tensor values and metadata exchanged with the interpreter
//!
//! This module provides:
//! - Runtime shapes, element types and devices
//! - Host-resident and device-resident values sharing one element buffer
//! - `TensorMeta`, the fixed description tracked for every handle

pub mod core;
pub mod storage;
pub mod devices;

// Re-export main types for convenience
pub use self::core::{Shape, DType, TensorMeta};
pub use storage::{TensorData, HostTensor, DeviceTensor};
pub use devices::Device;
