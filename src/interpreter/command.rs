//! Entries of the op queue

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use tokio::sync::oneshot;

use crate::error::AnvilResult;
use crate::ops::OpDef;
use crate::profiling::ProfileReport;
use super::Handle;

/// `origin` is the submitting thread; profiling scopes are kept per thread.
pub enum Command {
    Apply {
        op: Arc<dyn OpDef>,
        inputs: Vec<Handle>,
        outputs: Vec<Handle>,
        origin: ThreadId,
    },
    Delete(Handle),
    /// Recompute the value of a dropped record
    Regenerate(Handle),
    Barrier(oneshot::Sender<()>),
    PushScope { origin: ThreadId, name: String },
    PopScope { origin: ThreadId, name: String },
    StartProfile,
    StopProfile(oneshot::Sender<AnvilResult<ProfileReport>>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Apply { op, inputs, outputs, origin } => f
                .debug_struct("Apply")
                .field("op", &op.name())
                .field("inputs", inputs)
                .field("outputs", outputs)
                .field("origin", origin)
                .finish(),
            Command::Delete(h) => f.debug_tuple("Delete").field(h).finish(),
            Command::Regenerate(h) => f.debug_tuple("Regenerate").field(h).finish(),
            Command::Barrier(_) => f.write_str("Barrier"),
            Command::PushScope { origin, name } => f
                .debug_struct("PushScope")
                .field("origin", origin)
                .field("name", name)
                .finish(),
            Command::PopScope { origin, name } => f
                .debug_struct("PopScope")
                .field("origin", origin)
                .field("name", name)
                .finish(),
            Command::StartProfile => f.write_str("StartProfile"),
            Command::StopProfile(_) => f.write_str("StopProfile"),
        }
    }
}
