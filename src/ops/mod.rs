//! Operation descriptors and kernels

pub mod core;
pub mod elemwise;

pub use self::core::*;
pub use elemwise::*;

use std::sync::Arc;

use crate::{error::AnvilResult, tensor::DeviceTensor};

/// Wrap a closure as a shared kernel
pub fn kernel_fn<F>(f: F) -> Arc<dyn Kernel>
where
    F: Fn(&dyn OpDef, &[DeviceTensor]) -> AnvilResult<Vec<DeviceTensor>> + Send + Sync + 'static,
{
    Arc::new(f)
}
