//! How queue entries reach the executor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{AnvilError, AnvilResult};
use super::command::Command;
use super::executor::Executor;

pub(crate) trait Dispatch: Send + Sync {
    fn submit(&self, command: Command) -> AnvilResult<()>;
    /// Process everything already submitted, then refuse new entries
    fn shutdown(&self) -> AnvilResult<()>;
    fn is_alive(&self) -> bool;
}

/// Unbounded queue drained by one background thread
pub(crate) struct WorkerDispatch {
    sender: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerDispatch {
    pub fn spawn(name: &str, executor: Arc<Executor>) -> AnvilResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(executor, receiver))?;
        tracing::info!(worker = name, "worker started");
        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn run_worker(executor: Arc<Executor>, mut receiver: mpsc::UnboundedReceiver<Command>) {
    let mut processed = 0u64;
    while let Some(command) = receiver.blocking_recv() {
        executor.process(command);
        processed += 1;
    }
    tracing::debug!(processed, "queue closed, worker exiting");
}

impl Dispatch for WorkerDispatch {
    fn submit(&self, command: Command) -> AnvilResult<()> {
        let sender = self.sender.read();
        let sender = sender.as_ref().ok_or(AnvilError::ChannelClosed)?;
        sender.send(command).map_err(|_| AnvilError::ChannelClosed)
    }

    fn shutdown(&self) -> AnvilResult<()> {
        // Dropping the sender lets the worker drain the queue and return.
        self.sender.write().take();
        if let Some(worker) = self.worker.lock().take() {
            worker
                .join()
                .map_err(|_| AnvilError::InternalError("worker thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.sender.read().is_some()
            && self
                .worker
                .lock()
                .as_ref()
                .map_or(false, |worker| !worker.is_finished())
    }
}

/// Runs every entry on the submitting thread, one at a time
pub(crate) struct InlineDispatch {
    executor: Executor,
    serial: Mutex<()>,
    open: AtomicBool,
}

impl InlineDispatch {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            serial: Mutex::new(()),
            open: AtomicBool::new(true),
        }
    }
}

impl Dispatch for InlineDispatch {
    fn submit(&self, command: Command) -> AnvilResult<()> {
        let _serial = self.serial.lock();
        if !self.open.load(Ordering::Acquire) {
            return Err(AnvilError::ChannelClosed);
        }
        self.executor.process(command);
        Ok(())
    }

    fn shutdown(&self) -> AnvilResult<()> {
        let _serial = self.serial.lock();
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
