//! Op descriptors and the apply capability consumed by the interpreter

use std::any::Any;
use std::fmt::Debug;

use crate::{
    tensor::{DeviceTensor, TensorMeta},
    error::AnvilResult,
};

/// Descriptor of an operation submitted through `Channel::apply_op`.
///
/// The interpreter never looks inside a descriptor beyond this trait; the
/// kernel recovers the concrete type through `as_any`.
pub trait OpDef: Send + Sync + Debug {
    /// Get operation name for debugging and profiling
    fn name(&self) -> &str;

    /// Number of outputs produced for `num_inputs` inputs.
    ///
    /// Must be known at submission time, before the kernel runs.
    fn num_outputs(&self, _num_inputs: usize) -> usize {
        1
    }

    /// Infer output metadata from input metadata without computing values.
    ///
    /// `None` means inference is not possible; metadata is then fixed by
    /// the first successful compute step.
    fn infer_output_meta(&self, _inputs: &[TensorMeta]) -> Option<Vec<TensorMeta>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// The external apply capability.
///
/// Only ever called from the worker, one call at a time. Implementations
/// must not retain the inputs past the call.
pub trait Kernel: Send + Sync {
    fn apply(&self, op: &dyn OpDef, inputs: &[DeviceTensor]) -> AnvilResult<Vec<DeviceTensor>>;
}

impl<F> Kernel for F
where
    F: Fn(&dyn OpDef, &[DeviceTensor]) -> AnvilResult<Vec<DeviceTensor>> + Send + Sync,
{
    fn apply(&self, op: &dyn OpDef, inputs: &[DeviceTensor]) -> AnvilResult<Vec<DeviceTensor>> {
        self(op, inputs)
    }
}
