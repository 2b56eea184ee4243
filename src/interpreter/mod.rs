//! Asynchronous tensor interpreter
//!
//! Callers submit work through a [`Channel`] and get back opaque
//! [`Handle`]s immediately. A single executor processes the op queue in
//! submission order; value and metadata queries block until the tensor
//! they ask about has been computed. Failures are captured on the worker,
//! attached to every tensor that depends on the failed one, and raised on
//! the first synchronizing call that touches them.

pub mod cache;
pub mod channel;
pub(crate) mod command;
pub(crate) mod dispatch;
pub(crate) mod executor;
pub mod options;
pub mod record;
pub mod sink;
pub mod table;

use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::config::{ChannelKind, InterpreterConfig};
use crate::error::AnvilResult;
use crate::ops::{Kernel, ReferenceKernel};
use self::channel::TensorChannel;

pub use self::channel::Channel;
pub use self::options::{
    OptionRegistry, ASYNC_LEVEL, CANDIDATE_CACHE_SIZE, CANDIDATE_MAX_ELEMENTS,
    EAGER_SHAPE_INFERENCE, ENABLE_DROP, OPTION_NAMES,
};
pub use self::sink::{ErrorSink, Failure};

/// Opaque reference to a tensor record. Ids are never reused within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn id(&self) -> u64 {
        self.0
    }

    /// A handle for an arbitrary id, mostly useful for tests and logging
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorState {
    Pending,
    Ready,
    Failed,
    /// Computed, then released by `drop_value`; recomputed on demand
    Dropped,
}

/// Point-in-time counters of a channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Records held by the table, including deleted ones kept for recomputation
    pub retained: usize,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub submitted: u64,
    pub processed: u64,
    pub failures_captured: u64,
}

impl ChannelStats {
    /// Handles callers can still query
    pub fn live(&self) -> usize {
        self.pending + self.ready + self.failed + self.dropped
    }
}

/// Owns configuration and the kernel, and creates channels
pub struct Interpreter {
    config: InterpreterConfig,
    kernel: Arc<dyn Kernel>,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig, kernel: Arc<dyn Kernel>) -> AnvilResult<Self> {
        config.validate()?;
        Ok(Self { config, kernel })
    }

    /// An interpreter running the built-in elementwise kernels
    pub fn with_reference_kernel(config: InterpreterConfig) -> AnvilResult<Self> {
        Self::new(config, Arc::new(ReferenceKernel))
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn create_channel(&self) -> AnvilResult<Arc<dyn Channel>> {
        let kernel = self.kernel.clone();
        let channel: Arc<dyn Channel> = match self.config.channel.kind {
            ChannelKind::Worker => Arc::new(TensorChannel::spawn(&self.config, kernel)?),
            ChannelKind::Inline => Arc::new(TensorChannel::inline(&self.config, kernel)?),
        };
        tracing::info!(kind = ?self.config.channel.kind, "channel created");
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Elemwise, ElemwiseMode};
    use crate::tensor::HostTensor;

    fn inline_channel() -> Arc<dyn Channel> {
        let mut config = InterpreterConfig::default();
        config.channel.kind = ChannelKind::Inline;
        Interpreter::with_reference_kernel(config)
            .unwrap()
            .create_channel()
            .unwrap()
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::from_raw(7).to_string(), "#7");
        assert_eq!(Handle::from_raw(7).id(), 7);
    }

    #[test]
    fn test_inline_channel_settles_on_submit() {
        let channel = inline_channel();
        let x = channel
            .put(HostTensor::from_f32([3], vec![1.0, -2.0, 3.0]).unwrap(), false)
            .unwrap();
        let y = channel
            .apply_op(Arc::new(Elemwise::new(ElemwiseMode::Relu)), &[x])
            .unwrap()[0];
        assert_eq!(channel.state(y).unwrap(), TensorState::Ready);
        assert_eq!(channel.get_value(y).unwrap().to_vec_f32().unwrap(), vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_stats_count_states() {
        let channel = inline_channel();
        let x = channel
            .put(HostTensor::from_f32([2], vec![1.0, 2.0]).unwrap(), true)
            .unwrap();
        let _ = channel
            .apply_op(Arc::new(Elemwise::new(ElemwiseMode::DivScalar(0.0))), &[x])
            .unwrap();
        let stats = channel.stats();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.live(), 2);
        assert_eq!(stats.failures_captured, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = InterpreterConfig::default();
        config.options.async_level = 5;
        assert!(Interpreter::with_reference_kernel(config).is_err());
    }
}
