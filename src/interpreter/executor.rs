//! Execution of op-queue entries
//!
//! `Executor::process` is the only code that moves a record out of
//! `Pending` or stores a computed value. It runs on the worker thread for
//! the worker channel and on the submitting thread for the inline channel;
//! in both cases entries are processed one at a time in queue order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;
use parking_lot::{Condvar, Mutex};

use crate::config::InterpreterConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::memory::MemoryTracker;
use crate::ops::{Kernel, OpDef};
use crate::profiling::Profiler;
use crate::tensor::{Device, DeviceTensor};
use super::cache::CandidateCache;
use super::command::Command;
use super::options::OptionRegistry;
use super::record::{Completion, Resident};
use super::sink::Failure;
use super::table::HandleTable;
use super::Handle;

/// State shared between caller threads and the executor
#[derive(Debug)]
pub(crate) struct Shared {
    pub table: Mutex<HandleTable>,
    /// Notified whenever the executor finishes an entry
    pub changed: Condvar,
    pub options: OptionRegistry,
    pub candidates: Mutex<CandidateCache>,
    pub memory: Arc<MemoryTracker>,
    pub closed: AtomicBool,
    pub profiling: AtomicBool,
    pub submitted: AtomicU64,
    pub default_device: Device,
}

impl Shared {
    pub fn new(config: &InterpreterConfig) -> Self {
        Self {
            table: Mutex::new(HandleTable::new()),
            changed: Condvar::new(),
            options: OptionRegistry::new(&config.options),
            candidates: Mutex::new(CandidateCache::new()),
            memory: MemoryTracker::new(),
            closed: AtomicBool::new(false),
            profiling: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            default_device: config.channel.default_device,
        }
    }
}

pub(crate) struct Executor {
    shared: Arc<Shared>,
    kernel: Arc<dyn Kernel>,
    profiler: Mutex<Profiler>,
}

impl Executor {
    pub fn new(shared: Arc<Shared>, kernel: Arc<dyn Kernel>) -> Self {
        Self {
            shared,
            kernel,
            profiler: Mutex::new(Profiler::new()),
        }
    }

    pub fn process(&self, command: Command) {
        tracing::trace!(?command, "processing");
        match command {
            Command::Apply { op, inputs, outputs, origin } => self.apply(op, &inputs, &outputs, origin),
            Command::Delete(handle) => self.shared.table.lock().retire(handle),
            Command::Regenerate(handle) => {
                // A failure is stored on the record and seen by the waiting caller.
                let _ = self.materialize(handle);
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::PushScope { origin, name } => self.profiler.lock().push_scope(origin, name),
            Command::PopScope { origin, name } => self.profiler.lock().pop_scope(origin, &name),
            Command::StartProfile => {
                if let Err(error) = self.profiler.lock().start() {
                    tracing::warn!(%error, "start_profile ignored");
                }
            }
            Command::StopProfile(reply) => {
                let _ = reply.send(self.profiler.lock().stop());
            }
        }

        self.shared.table.lock().processed += 1;
        self.shared.changed.notify_all();
    }

    fn apply(&self, op: Arc<dyn OpDef>, inputs: &[Handle], outputs: &[Handle], origin: ThreadId) {
        let span = tracing::trace_span!("apply", op = op.name(), inputs = inputs.len());
        let _enter = span.enter();
        let started = Instant::now();

        let result = match self.gather(inputs) {
            Ok(values) => self
                .invoke(op.as_ref(), &values, outputs.len())
                .map_err(|error| self.shared.table.lock().sink.capture(op.name(), error)),
            Err(cause) => Err(self.shared.table.lock().sink.propagate(op.name(), &cause)),
        };
        self.profiler.lock().record_op(origin, op.name(), started.elapsed());

        let mut table = self.shared.table.lock();
        self.commit(&mut table, op.name(), outputs, result);
        for input in inputs {
            table.release_use(*input);
        }
    }

    /// Values of `inputs`, regenerating dropped ones; the first failed input wins
    fn gather(&self, inputs: &[Handle]) -> Result<Vec<DeviceTensor>, Arc<Failure>> {
        inputs.iter().map(|h| self.materialize(*h)).collect()
    }

    /// The device value of `handle`, recomputing it along its computing path if
    /// the value was dropped.
    fn materialize(&self, handle: Handle) -> Result<DeviceTensor, Arc<Failure>> {
        let path = {
            let mut table = self.shared.table.lock();
            let lookup = match table.get(handle) {
                None => Err(AnvilError::InvalidHandle(handle)),
                Some(record) => match &record.completion {
                    Completion::Failed(failure) => return Err(failure.clone()),
                    Completion::Pending => Err(AnvilError::InternalError(format!(
                        "{} consumed before it was computed",
                        handle
                    ))),
                    Completion::Ready => match (record.device_value(), &record.path) {
                        (Some(value), _) => return Ok(value),
                        (None, Some(path)) => Ok(path.clone()),
                        (None, None) => Err(AnvilError::InternalError(format!(
                            "value of {} was released and cannot be recomputed",
                            handle
                        ))),
                    },
                },
            };
            match lookup {
                Ok(path) => path,
                Err(error) => return Err(table.sink.capture("materialize", error)),
            }
        };

        tracing::debug!(handle = %handle, op = path.op.name(), "regenerating dropped value");
        let op = path.op.as_ref();
        let result = self.gather(&path.inputs).and_then(|values| {
            self.invoke(op, &values, op.num_outputs(values.len()))
                .and_then(|outputs| {
                    outputs.into_iter().nth(path.output_index).ok_or_else(|| {
                        AnvilError::operation_error(op.name(), "output index out of range")
                    })
                })
                .map_err(|error| self.shared.table.lock().sink.capture(op.name(), error))
        });

        let mut table = self.shared.table.lock();
        let record = table.get_mut(handle);
        match (result, record) {
            (Ok(value), Some(record)) => {
                let guard = self.shared.memory.allocate(value.nbytes());
                record.value = Some(Resident::new(value.clone(), guard));
                Ok(value)
            }
            (Ok(value), None) => Ok(value),
            (Err(failure), Some(record)) => {
                record.completion = Completion::Failed(failure.clone());
                Err(failure)
            }
            (Err(failure), None) => Err(failure),
        }
    }

    /// Call the kernel, turning panics and wrong output counts into errors
    fn invoke(&self, op: &dyn OpDef, inputs: &[DeviceTensor], expected: usize) -> AnvilResult<Vec<DeviceTensor>> {
        let outputs = match panic::catch_unwind(AssertUnwindSafe(|| self.kernel.apply(op, inputs))) {
            Ok(result) => result?,
            Err(payload) => {
                return Err(AnvilError::InternalError(format!(
                    "kernel panicked in '{}': {}",
                    op.name(),
                    panic_message(payload.as_ref())
                )))
            }
        };
        if outputs.len() != expected {
            return Err(AnvilError::operation_error(
                op.name(),
                &format!("kernel returned {} outputs, expected {}", outputs.len(), expected),
            ));
        }
        Ok(outputs)
    }

    fn commit(
        &self,
        table: &mut HandleTable,
        op_name: &str,
        outputs: &[Handle],
        result: Result<Vec<DeviceTensor>, Arc<Failure>>,
    ) {
        let result = match result {
            Ok(values) => match metadata_mismatch(table, outputs, &values) {
                Some(error) => Err(table.sink.capture(op_name, error)),
                None => Ok(values),
            },
            Err(failure) => Err(failure),
        };

        match result {
            Ok(values) => {
                for (handle, value) in outputs.iter().zip(values) {
                    let Some(record) = table.get_mut(*handle) else {
                        continue;
                    };
                    let meta = value.meta();
                    let guard = self.shared.memory.allocate(value.nbytes());
                    record.meta.get_or_insert(meta);
                    record.value = Some(Resident::new(value, guard));
                    record.completion = Completion::Ready;
                }
                tracing::debug!(op = op_name, outputs = outputs.len(), "operation completed");
            }
            Err(failure) => {
                for handle in outputs {
                    if let Some(record) = table.get_mut(*handle) {
                        record.completion = Completion::Failed(failure.clone());
                    }
                }
            }
        }
    }
}

/// Metadata fixed at submission must match what the kernel produced
fn metadata_mismatch(table: &HandleTable, outputs: &[Handle], values: &[DeviceTensor]) -> Option<AnvilError> {
    outputs.iter().zip(values).find_map(|(handle, value)| {
        let expected = table.get(*handle)?.meta.as_ref()?;
        let actual = value.meta();
        (*expected != actual).then(|| {
            AnvilError::shape_error(
                &expected.to_string(),
                &actual.to_string(),
                Some("inferred output metadata disagrees with the kernel result"),
            )
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
