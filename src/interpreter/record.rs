//! Per-handle state owned by the handle table

use std::sync::Arc;

use crate::memory::MemoryGuard;
use crate::ops::OpDef;
use crate::tensor::{DeviceTensor, HostTensor, TensorMeta};
use super::sink::Failure;
use super::{Handle, TensorState};

/// How to recompute a record whose value was dropped
#[derive(Debug, Clone)]
pub struct ComputePath {
    pub op: Arc<dyn OpDef>,
    pub inputs: Vec<Handle>,
    pub output_index: usize,
}

#[derive(Debug, Clone)]
pub enum Completion {
    Pending,
    Ready,
    Failed(Arc<Failure>),
}

/// A device value together with its memory reservation.
///
/// Records holding the same storage share one reservation.
#[derive(Debug)]
pub struct Resident {
    pub tensor: DeviceTensor,
    _guard: Arc<MemoryGuard>,
}

impl Resident {
    pub fn new(tensor: DeviceTensor, guard: impl Into<Arc<MemoryGuard>>) -> Self {
        Self {
            tensor,
            _guard: guard.into(),
        }
    }
}

#[derive(Debug)]
pub struct TensorRecord {
    pub meta: Option<TensorMeta>,
    pub host: Option<HostTensor>,
    pub value: Option<Resident>,
    pub completion: Completion,
    pub path: Option<ComputePath>,
    /// Queued applies that read this record
    pub pending_uses: usize,
    /// Computing paths of other records that read this record
    pub path_refs: usize,
    /// `del` was called; the handle is closed to new work
    pub delete_requested: bool,
    /// The worker processed the delete; the handle is invisible to callers
    pub retired: bool,
}

impl TensorRecord {
    pub fn ready(meta: TensorMeta, value: Resident, host: Option<HostTensor>) -> Self {
        Self {
            meta: Some(meta),
            host,
            value: Some(value),
            completion: Completion::Ready,
            path: None,
            pending_uses: 0,
            path_refs: 0,
            delete_requested: false,
            retired: false,
        }
    }

    pub fn pending(meta: Option<TensorMeta>, path: Option<ComputePath>) -> Self {
        Self {
            meta,
            host: None,
            value: None,
            completion: Completion::Pending,
            path,
            pending_uses: 0,
            path_refs: 0,
            delete_requested: false,
            retired: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.completion, Completion::Pending)
    }

    pub fn failure(&self) -> Option<&Arc<Failure>> {
        match &self.completion {
            Completion::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Ready but holding neither a device value nor a host snapshot
    pub fn is_dropped(&self) -> bool {
        matches!(self.completion, Completion::Ready) && self.value.is_none() && self.host.is_none()
    }

    pub fn state(&self) -> TensorState {
        match self.completion {
            Completion::Pending => TensorState::Pending,
            Completion::Failed(_) => TensorState::Failed,
            Completion::Ready if self.is_dropped() => TensorState::Dropped,
            Completion::Ready => TensorState::Ready,
        }
    }

    pub fn device_value(&self) -> Option<DeviceTensor> {
        self.value.as_ref().map(|r| r.tensor.clone())
    }

    /// True once nothing can observe or consume the record any more
    pub fn reclaimable(&self) -> bool {
        self.retired && self.pending_uses == 0 && self.path_refs == 0
    }
}
