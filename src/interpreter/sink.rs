//! Capture of worker-side failures and their causal chains

use std::sync::Arc;

use crate::error::{AnvilError, AsyncError};

/// One captured failure.
///
/// A failure either carries the kernel error that caused it (`cause` is
/// `None`) or was propagated from a failed input, in which case `cause`
/// points at the input's failure. Causes are always created earlier, so the
/// chain is acyclic.
#[derive(Debug)]
pub struct Failure {
    operation: String,
    error: AnvilError,
    cause: Option<Arc<Failure>>,
}

impl Failure {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn root(&self) -> &Failure {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }

    /// Build the error a caller sees when synchronizing on this failure
    pub fn to_error(&self) -> AnvilError {
        let mut propagated_through = Vec::new();
        let mut current = self;
        while let Some(cause) = &current.cause {
            propagated_through.push(current.operation.clone());
            current = cause;
        }
        propagated_through.reverse();
        AsyncError {
            operation: current.operation.clone(),
            propagated_through,
            source: Box::new(current.error.clone()),
        }
        .into()
    }
}

/// Creates failures and remembers the oldest root failure not yet reported by `sync`
#[derive(Debug, Default)]
pub struct ErrorSink {
    /// Later failures are not kept; they stay reachable from their records
    unreported: Option<Arc<Failure>>,
    captured: u64,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a kernel error raised while running `operation`
    pub fn capture(&mut self, operation: &str, error: AnvilError) -> Arc<Failure> {
        tracing::warn!(operation, %error, "operation failed on worker");
        let failure = Arc::new(Failure {
            operation: operation.to_string(),
            error,
            cause: None,
        });
        if self.unreported.is_none() {
            self.unreported = Some(failure.clone());
        }
        self.captured += 1;
        failure
    }

    /// Poison an output of `operation` because one of its inputs failed
    pub fn propagate(&mut self, operation: &str, cause: &Arc<Failure>) -> Arc<Failure> {
        tracing::debug!(operation, root = cause.root().operation(), "skipping operation with failed input");
        Arc::new(Failure {
            operation: operation.to_string(),
            error: AnvilError::operation_error(operation, "input failed"),
            cause: Some(cause.clone()),
        })
    }

    /// The oldest root failure captured since the last call, if any
    pub fn take_unreported(&mut self) -> Option<AnvilError> {
        self.unreported.take().map(|f| f.to_error())
    }

    pub fn captured(&self) -> u64 {
        self.captured
    }
}
