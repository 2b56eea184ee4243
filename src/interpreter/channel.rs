//! The public channel façade

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::config::InterpreterConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::memory::MemoryGuard;
use crate::ops::{Kernel, OpDef};
use crate::profiling::ProfileReport;
use crate::tensor::{DType, Device, DeviceTensor, HostTensor, Shape, TensorMeta};
use super::command::Command;
use super::dispatch::{Dispatch, InlineDispatch, WorkerDispatch};
use super::executor::{Executor, Shared};
use super::options::{
    ASYNC_LEVEL, CANDIDATE_CACHE_SIZE, CANDIDATE_MAX_ELEMENTS, EAGER_SHAPE_INFERENCE, ENABLE_DROP,
};
use super::record::{Completion, ComputePath, Resident, TensorRecord};
use super::{ChannelStats, Handle, TensorState};

/// Upper bound on one condition-variable wait before liveness is rechecked
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Submission and query interface of the interpreter.
///
/// Every method may be called from any thread. Submission methods return
/// without waiting for the worker; value and metadata accessors block until
/// the record they ask about has been computed.
pub trait Channel: Send + Sync {
    /// Ingest a host value. `no_cache` opts out of storage reuse between
    /// identical small values.
    fn put(&self, value: HostTensor, no_cache: bool) -> AnvilResult<Handle>;

    /// Ingest a device value, optionally with a host copy of the same data
    fn put_device(&self, value: DeviceTensor, host: Option<HostTensor>) -> AnvilResult<Handle>;

    /// Release a handle. Queries made before the worker reaches the delete
    /// still see the last value; a second `del` is an invalid-handle error.
    fn del(&self, handle: Handle) -> AnvilResult<()>;

    /// Hint that the value of `handle` may be released and recomputed on
    /// demand. Never fails; ignored when not applicable.
    fn drop_value(&self, handle: Handle);

    /// Submit `op` over `inputs`, returning one pending handle per output
    fn apply_op(&self, op: Arc<dyn OpDef>, inputs: &[Handle]) -> AnvilResult<Vec<Handle>>;

    fn get_value(&self, handle: Handle) -> AnvilResult<HostTensor>;
    fn get_shape(&self, handle: Handle) -> AnvilResult<Shape>;
    fn get_dtype(&self, handle: Handle) -> AnvilResult<DType>;
    fn get_device(&self, handle: Handle) -> AnvilResult<Device>;
    fn get_dev_tensor(&self, handle: Handle) -> AnvilResult<DeviceTensor>;

    /// Lifecycle state of `handle` without waiting
    fn state(&self, handle: Handle) -> AnvilResult<TensorState>;

    fn check_available(&self) -> bool;

    /// Wait until every entry submitted so far has been processed.
    ///
    /// Reports the first compute failure captured since the previous `sync`.
    fn sync(&self) -> AnvilResult<()>;

    /// Drain the queue and stop the worker
    fn close(&self) -> AnvilResult<()>;

    fn get_option(&self, name: &str) -> AnvilResult<usize>;
    fn set_option(&self, name: &str, value: usize) -> AnvilResult<()>;
    fn clear_candidates(&self);

    fn start_profile(&self) -> AnvilResult<()>;
    fn stop_profile(&self) -> AnvilResult<ProfileReport>;

    /// Open a profiling scope on the calling thread's scope stack. Ops are
    /// attributed to the scopes open on the thread that submitted them.
    fn push_scope(&self, name: &str) -> AnvilResult<()>;
    /// Close the innermost scope of the calling thread; a name that does not
    /// match is reported in the profile.
    fn pop_scope(&self, name: &str) -> AnvilResult<()>;

    fn stats(&self) -> ChannelStats;
}

enum Check<T> {
    Done(AnvilResult<T>),
    Wait,
    /// The value was dropped and must be recomputed by the executor
    Regenerate,
}

pub(crate) struct TensorChannel<D: Dispatch> {
    shared: Arc<Shared>,
    dispatch: D,
}

impl TensorChannel<WorkerDispatch> {
    pub(crate) fn spawn(config: &InterpreterConfig, kernel: Arc<dyn Kernel>) -> AnvilResult<Self> {
        let shared = Arc::new(Shared::new(config));
        let executor = Arc::new(Executor::new(shared.clone(), kernel));
        let dispatch = WorkerDispatch::spawn(&config.channel.worker_name, executor)?;
        Self::start(shared, dispatch, config)
    }
}

impl TensorChannel<InlineDispatch> {
    pub(crate) fn inline(config: &InterpreterConfig, kernel: Arc<dyn Kernel>) -> AnvilResult<Self> {
        let shared = Arc::new(Shared::new(config));
        let dispatch = InlineDispatch::new(Executor::new(shared.clone(), kernel));
        Self::start(shared, dispatch, config)
    }
}

impl<D: Dispatch> TensorChannel<D> {
    fn start(shared: Arc<Shared>, dispatch: D, config: &InterpreterConfig) -> AnvilResult<Self> {
        let channel = Self { shared, dispatch };
        if config.profiling.start_enabled {
            channel.start_profile()?;
        }
        Ok(channel)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> AnvilResult<()> {
        if self.is_closed() {
            return Err(AnvilError::ChannelClosed);
        }
        Ok(())
    }

    /// Enqueue `command`, returning its position in the queue
    fn submit(&self, command: Command) -> AnvilResult<u64> {
        let ticket = self.shared.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(error) = self.dispatch.submit(command) {
            self.shared.submitted.fetch_sub(1, Ordering::AcqRel);
            return Err(error);
        }
        Ok(ticket)
    }

    fn insert_ready(&self, value: DeviceTensor, charge: Arc<MemoryGuard>, host: Option<HostTensor>) -> Handle {
        let meta = value.meta();
        let record = TensorRecord::ready(meta, Resident::new(value, charge), host);
        let handle = self.shared.table.lock().insert(record);
        tracing::debug!(handle = %handle, "tensor put");
        handle
    }

    /// Block until `check` settles for `handle`.
    ///
    /// A `Regenerate` answer enqueues one recompute request; another is only
    /// sent if the value was dropped again after that request was processed.
    fn wait_for<T>(
        &self,
        handle: Handle,
        mut check: impl FnMut(&mut TensorRecord) -> Check<T>,
    ) -> AnvilResult<T> {
        self.ensure_open()?;
        let mut regenerate_ticket: Option<u64> = None;
        let mut table = self.shared.table.lock();
        loop {
            let answer = check(table.visible_mut(handle)?);
            match answer {
                Check::Done(result) => return result,
                Check::Regenerate => {
                    let stale = regenerate_ticket.map_or(true, |ticket| table.processed >= ticket);
                    if stale {
                        drop(table);
                        regenerate_ticket = Some(self.submit(Command::Regenerate(handle))?);
                        table = self.shared.table.lock();
                        continue;
                    }
                }
                Check::Wait => {}
            }
            if !self.dispatch.is_alive() {
                return Err(AnvilError::ChannelClosed);
            }
            self.shared.changed.wait_for(&mut table, WAIT_SLICE);
        }
    }

    /// Wait until `handle` leaves `Pending`, surfacing its failure if any
    fn wait_settled(&self, handle: Handle) -> AnvilResult<()> {
        self.wait_for(handle, |record| match &record.completion {
            Completion::Pending => Check::Wait,
            Completion::Failed(failure) => Check::Done(Err(failure.to_error())),
            Completion::Ready => Check::Done(Ok(())),
        })
    }

    /// Metadata is answered as soon as it is known, even while pending
    fn get_meta(&self, handle: Handle) -> AnvilResult<TensorMeta> {
        self.wait_for(handle, |record| match (&record.completion, &record.meta) {
            (Completion::Failed(failure), _) => Check::Done(Err(failure.to_error())),
            (_, Some(meta)) => Check::Done(Ok(meta.clone())),
            (Completion::Pending, None) => Check::Wait,
            (Completion::Ready, None) => Check::Done(Err(AnvilError::InternalError(
                "computed tensor has no metadata".to_string(),
            ))),
        })
    }

    /// Queue deletes for submitted outputs that will not be returned
    fn abandon(&self, outputs: &[Handle]) {
        {
            let mut table = self.shared.table.lock();
            for output in outputs {
                if let Ok(record) = table.open_mut(*output) {
                    record.delete_requested = true;
                }
            }
        }
        for output in outputs {
            if let Err(error) = self.submit(Command::Delete(*output)) {
                tracing::debug!(handle = %output, %error, "could not delete abandoned output");
            }
        }
    }

    fn rollback_apply(&self, inputs: &[Handle], outputs: &[Handle]) {
        let mut table = self.shared.table.lock();
        for output in outputs {
            table.discard(*output);
        }
        for input in inputs {
            if let Some(record) = table.get_mut(*input) {
                record.pending_uses = record.pending_uses.saturating_sub(1);
            }
        }
    }
}

impl<D: Dispatch> Channel for TensorChannel<D> {
    fn put(&self, value: HostTensor, no_cache: bool) -> AnvilResult<Handle> {
        self.ensure_open()?;
        let device = self.shared.default_device;
        let options = &self.shared.options;
        let cacheable = !no_cache && value.numel() <= options.value(CANDIDATE_MAX_ELEMENTS);
        let (dev, charge) = if cacheable {
            let capacity = options.value(CANDIDATE_CACHE_SIZE);
            self.shared
                .candidates
                .lock()
                .upload(&value, device, capacity, &self.shared.memory)
        } else {
            let dev = DeviceTensor::from_host(&value, device);
            let charge = Arc::new(self.shared.memory.allocate(dev.nbytes()));
            (dev, charge)
        };
        Ok(self.insert_ready(dev, charge, Some(value)))
    }

    fn put_device(&self, value: DeviceTensor, host: Option<HostTensor>) -> AnvilResult<Handle> {
        self.ensure_open()?;
        if let Some(host) = &host {
            if host.shape() != value.shape() || host.dtype() != value.dtype() {
                return Err(AnvilError::InvalidInput(format!(
                    "host value {}{} does not match device value {}",
                    host.dtype(),
                    host.shape(),
                    value.meta()
                )));
            }
        }
        let charge = Arc::new(self.shared.memory.allocate(value.nbytes()));
        Ok(self.insert_ready(value, charge, host))
    }

    fn del(&self, handle: Handle) -> AnvilResult<()> {
        self.ensure_open()?;
        self.shared.table.lock().open_mut(handle)?.delete_requested = true;
        self.submit(Command::Delete(handle))?;
        Ok(())
    }

    fn drop_value(&self, handle: Handle) {
        if self.is_closed() || !self.shared.options.flag(ENABLE_DROP) {
            return;
        }
        let mut table = self.shared.table.lock();
        let Ok(record) = table.visible_mut(handle) else {
            return;
        };
        let droppable = matches!(record.completion, Completion::Ready)
            && record.path.is_some()
            && record.pending_uses == 0;
        if droppable && (record.value.is_some() || record.host.is_some()) {
            record.value = None;
            record.host = None;
            tracing::trace!(handle = %handle, "value dropped");
        }
    }

    fn apply_op(&self, op: Arc<dyn OpDef>, inputs: &[Handle]) -> AnvilResult<Vec<Handle>> {
        self.ensure_open()?;
        let options = &self.shared.options;
        let eager = options.flag(EAGER_SHAPE_INFERENCE);
        let record_path = options.flag(ENABLE_DROP);
        let num_outputs = op.num_outputs(inputs.len());

        let (outputs, inferred) = {
            let mut table = self.shared.table.lock();
            let mut metas = Vec::with_capacity(inputs.len());
            for input in inputs {
                metas.push(table.open_mut(*input)?.meta.clone());
            }
            let inferred = if eager {
                metas
                    .into_iter()
                    .collect::<Option<Vec<_>>>()
                    .and_then(|metas| op.infer_output_meta(&metas))
                    .filter(|metas| metas.len() == num_outputs)
            } else {
                None
            };

            for input in inputs {
                if let Some(record) = table.get_mut(*input) {
                    record.pending_uses += 1;
                    if record_path {
                        record.path_refs += num_outputs;
                    }
                }
            }
            let outputs: Vec<Handle> = (0..num_outputs)
                .map(|index| {
                    let meta = inferred.as_ref().map(|metas| metas[index].clone());
                    let path = record_path.then(|| ComputePath {
                        op: op.clone(),
                        inputs: inputs.to_vec(),
                        output_index: index,
                    });
                    table.insert(TensorRecord::pending(meta, path))
                })
                .collect();
            (outputs, inferred.is_some())
        };

        tracing::debug!(op = op.name(), inputs = ?inputs, outputs = ?outputs, "apply_op submitted");
        let command = Command::Apply {
            op,
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
            origin: thread::current().id(),
        };
        if let Err(error) = self.submit(command) {
            self.rollback_apply(inputs, &outputs);
            return Err(error);
        }

        match options.value(ASYNC_LEVEL) {
            0 => {
                let settled = outputs
                    .iter()
                    .try_for_each(|output| self.wait_settled(*output));
                if let Err(error) = settled {
                    // The caller never sees these handles, so nobody else can delete them.
                    self.abandon(&outputs);
                    return Err(error);
                }
            }
            1 if !inferred => {
                for output in &outputs {
                    // Only the metadata is needed here; failures surface on query.
                    let _ = self.wait_settled(*output);
                }
            }
            _ => {}
        }
        Ok(outputs)
    }

    fn get_value(&self, handle: Handle) -> AnvilResult<HostTensor> {
        self.wait_for(handle, |record| match &record.completion {
            Completion::Pending => Check::Wait,
            Completion::Failed(failure) => Check::Done(Err(failure.to_error())),
            Completion::Ready => {
                if let Some(host) = &record.host {
                    return Check::Done(Ok(host.clone()));
                }
                match record.device_value() {
                    Some(value) => {
                        let host = value.to_host();
                        record.host = Some(host.clone());
                        Check::Done(Ok(host))
                    }
                    None => Check::Regenerate,
                }
            }
        })
    }

    fn get_shape(&self, handle: Handle) -> AnvilResult<Shape> {
        self.get_meta(handle).map(|meta| meta.shape)
    }

    fn get_dtype(&self, handle: Handle) -> AnvilResult<DType> {
        self.get_meta(handle).map(|meta| meta.dtype)
    }

    fn get_device(&self, handle: Handle) -> AnvilResult<Device> {
        self.get_meta(handle).map(|meta| meta.device)
    }

    fn get_dev_tensor(&self, handle: Handle) -> AnvilResult<DeviceTensor> {
        self.wait_for(handle, |record| match &record.completion {
            Completion::Pending => Check::Wait,
            Completion::Failed(failure) => Check::Done(Err(failure.to_error())),
            Completion::Ready => match record.device_value() {
                Some(value) => Check::Done(Ok(value)),
                None => Check::Regenerate,
            },
        })
    }

    fn state(&self, handle: Handle) -> AnvilResult<TensorState> {
        self.ensure_open()?;
        let table = self.shared.table.lock();
        table.visible(handle).map(|record| record.state())
    }

    fn check_available(&self) -> bool {
        !self.is_closed() && self.dispatch.is_alive()
    }

    fn sync(&self) -> AnvilResult<()> {
        self.ensure_open()?;
        let (done, reached) = oneshot::channel();
        self.submit(Command::Barrier(done))?;
        reached.blocking_recv().map_err(|_| AnvilError::ChannelClosed)?;
        match self.shared.table.lock().sink.take_unreported() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn close(&self) -> AnvilResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(AnvilError::ChannelClosed);
        }
        self.dispatch.shutdown()?;
        self.shared.changed.notify_all();
        let table = self.shared.table.lock();
        tracing::info!(processed = table.processed, records = table.len(), "channel closed");
        Ok(())
    }

    fn get_option(&self, name: &str) -> AnvilResult<usize> {
        self.ensure_open()?;
        self.shared.options.get(name)
    }

    fn set_option(&self, name: &str, value: usize) -> AnvilResult<()> {
        self.ensure_open()?;
        self.shared.options.set(name, value)
    }

    fn clear_candidates(&self) {
        self.shared.candidates.lock().clear();
    }

    fn start_profile(&self) -> AnvilResult<()> {
        self.ensure_open()?;
        if self.shared.profiling.swap(true, Ordering::AcqRel) {
            return Err(AnvilError::ProfilingError("profile already started".to_string()));
        }
        if let Err(error) = self.submit(Command::StartProfile) {
            self.shared.profiling.store(false, Ordering::Release);
            return Err(error);
        }
        Ok(())
    }

    fn stop_profile(&self) -> AnvilResult<ProfileReport> {
        self.ensure_open()?;
        if !self.shared.profiling.swap(false, Ordering::AcqRel) {
            return Err(AnvilError::ProfilingError("profile not started".to_string()));
        }
        let (reply, report) = oneshot::channel();
        self.submit(Command::StopProfile(reply))?;
        let report = report.blocking_recv().map_err(|_| AnvilError::ChannelClosed)??;
        if !report.is_balanced() {
            tracing::warn!(
                open = ?report.open_scopes,
                mismatched = report.mismatches.len(),
                "profile stopped with unbalanced scopes"
            );
        }
        Ok(report)
    }

    fn push_scope(&self, name: &str) -> AnvilResult<()> {
        self.ensure_open()?;
        self.submit(Command::PushScope {
            origin: thread::current().id(),
            name: name.to_string(),
        })?;
        Ok(())
    }

    fn pop_scope(&self, name: &str) -> AnvilResult<()> {
        self.ensure_open()?;
        self.submit(Command::PopScope {
            origin: thread::current().id(),
            name: name.to_string(),
        })?;
        Ok(())
    }

    fn stats(&self) -> ChannelStats {
        let memory = self.shared.memory.stats();
        let table = self.shared.table.lock();
        let counts = table.count_states();
        let count = |state: TensorState| counts.get(&state).copied().unwrap_or(0);
        ChannelStats {
            pending: count(TensorState::Pending),
            ready: count(TensorState::Ready),
            failed: count(TensorState::Failed),
            dropped: count(TensorState::Dropped),
            retained: table.len(),
            bytes_in_use: memory.in_use,
            peak_bytes: memory.peak,
            submitted: self.shared.submitted.load(Ordering::Acquire),
            processed: table.processed,
            failures_captured: table.sink.captured(),
        }
    }
}

impl<D: Dispatch> Drop for TensorChannel<D> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(error) = self.close() {
                tracing::warn!(%error, "failed to close channel on drop");
            }
        }
    }
}
