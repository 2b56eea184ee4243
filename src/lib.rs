//! Anvil Interpreter - asynchronous execution channel for Anvil tensors
//!
//! Features:
//! - Non-blocking submission of tensor operations through opaque handles
//! - A single ordered worker with lazy synchronization on queries
//! - Failure propagation with the root cause preserved
//! - Recomputation of dropped values along their computing path
//! - Scoped profiling of executed operations

pub mod tensor;
pub mod ops;
pub mod profiling;
pub mod error;
pub mod config;
pub mod memory;
pub mod interpreter;
#[cfg(feature = "async")]
pub mod async_executor;

use crate::config::LoggingConfig;
use crate::error::AnvilResult;

pub use crate::config::{ConfigBuilder, InterpreterConfig};
pub use crate::error::{AnvilError, AsyncError};
pub use crate::interpreter::{Channel, ChannelStats, Handle, Interpreter, TensorState};
pub use crate::ops::{Elemwise, ElemwiseMode, Kernel, OpDef, ReferenceKernel};
pub use crate::profiling::ProfileReport;
pub use crate::tensor::{DType, Device, DeviceTensor, HostTensor, Shape, TensorMeta};
#[cfg(feature = "async")]
pub use crate::async_executor::{AsyncChannel, AsyncTensorAccess};

/// Initialize logging at the default level
pub fn init() -> AnvilResult<()> {
    init_with(&LoggingConfig::default())
}

/// Initialize logging from `config`. Calling it again is harmless; the first
/// subscriber stays installed.
pub fn init_with(config: &LoggingConfig) -> AnvilResult<()> {
    let level = config.tracing_level()?;
    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .try_init()
        .is_ok()
    {
        tracing::info!(version = version(), "Anvil interpreter initialized");
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
        };
        assert!(init_with(&config).is_err());
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
