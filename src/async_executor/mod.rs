//! Awaitable access to a channel from async code
//!
//! Channel queries block the calling thread until the worker catches up.
//! `AsyncChannel` moves those waits onto tokio's blocking pool so they can
//! be awaited without stalling a runtime thread.

use std::sync::Arc;
use async_trait::async_trait;

use crate::error::{AnvilError, AnvilResult};
use crate::interpreter::{Channel, Handle};
use crate::profiling::ProfileReport;
use crate::tensor::{DeviceTensor, HostTensor, Shape};

#[async_trait]
pub trait AsyncTensorAccess: Send + Sync {
    async fn value(&self, handle: Handle) -> AnvilResult<HostTensor>;
    async fn shape(&self, handle: Handle) -> AnvilResult<Shape>;
    async fn dev_tensor(&self, handle: Handle) -> AnvilResult<DeviceTensor>;
    async fn sync(&self) -> AnvilResult<()>;
    async fn stop_profile(&self) -> AnvilResult<ProfileReport>;
}

#[derive(Clone)]
pub struct AsyncChannel {
    channel: Arc<dyn Channel>,
}

impl AsyncChannel {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// The wrapped channel, for the non-blocking submission calls
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    async fn run_blocking<T, F>(&self, f: F) -> AnvilResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Channel) -> AnvilResult<T> + Send + 'static,
    {
        let channel = self.channel.clone();
        tokio::task::spawn_blocking(move || f(channel.as_ref()))
            .await
            .map_err(|e| AnvilError::InternalError(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl AsyncTensorAccess for AsyncChannel {
    async fn value(&self, handle: Handle) -> AnvilResult<HostTensor> {
        self.run_blocking(move |c| c.get_value(handle)).await
    }

    async fn shape(&self, handle: Handle) -> AnvilResult<Shape> {
        self.run_blocking(move |c| c.get_shape(handle)).await
    }

    async fn dev_tensor(&self, handle: Handle) -> AnvilResult<DeviceTensor> {
        self.run_blocking(move |c| c.get_dev_tensor(handle)).await
    }

    async fn sync(&self) -> AnvilResult<()> {
        self.run_blocking(|c| c.sync()).await
    }

    async fn stop_profile(&self) -> AnvilResult<ProfileReport> {
        self.run_blocking(|c| c.stop_profile()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::interpreter::Interpreter;
    use crate::ops::{Elemwise, ElemwiseMode};

    fn worker_channel() -> AsyncChannel {
        let interpreter = Interpreter::with_reference_kernel(InterpreterConfig::default()).unwrap();
        AsyncChannel::new(interpreter.create_channel().unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_await_value() {
        let channel = worker_channel();
        let x = channel
            .channel()
            .put(HostTensor::from_f32([2], vec![1.0, 2.0]).unwrap(), false)
            .unwrap();
        let y = channel
            .channel()
            .apply_op(Arc::new(Elemwise::new(ElemwiseMode::MulScalar(3.0))), &[x])
            .unwrap()[0];

        assert_eq!(channel.shape(y).await.unwrap(), Shape::new(vec![2]));
        let value = channel.value(y).await.unwrap();
        assert_eq!(value.to_vec_f32().unwrap(), vec![3.0, 6.0]);
        assert!(channel.sync().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_await_failure() {
        let channel = worker_channel();
        let x = channel
            .channel()
            .put(HostTensor::from_f32([1], vec![1.0]).unwrap(), false)
            .unwrap();
        let y = channel
            .channel()
            .apply_op(Arc::new(Elemwise::new(ElemwiseMode::DivScalar(0.0))), &[x])
            .unwrap()[0];

        let error = channel.value(y).await.unwrap_err();
        assert!(error.is_async());
        assert!(channel.sync().await.is_err());
        assert!(channel.sync().await.is_ok());
    }
}
