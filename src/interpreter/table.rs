//! The handle table: the only owner of tensor records

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AnvilError, AnvilResult};
use super::record::TensorRecord;
use super::sink::ErrorSink;
use super::{Handle, TensorState};

/// Next handle id for the whole process, so handles from different channels never collide
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct HandleTable {
    records: HashMap<Handle, TensorRecord>,
    pub sink: ErrorSink,
    pub processed: u64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            sink: ErrorSink::new(),
            processed: 0,
        }
    }

    /// Insert a record under a fresh handle; ids are never reused within the process
    pub fn insert(&mut self, record: TensorRecord) -> Handle {
        let handle = Handle(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed));
        self.records.insert(handle, record);
        handle
    }

    /// Any record still in the table, including retired ones
    pub fn get(&self, handle: Handle) -> Option<&TensorRecord> {
        self.records.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut TensorRecord> {
        self.records.get_mut(&handle)
    }

    /// A record callers may still query
    pub fn visible(&self, handle: Handle) -> AnvilResult<&TensorRecord> {
        match self.records.get(&handle) {
            Some(record) if !record.retired => Ok(record),
            _ => Err(AnvilError::InvalidHandle(handle)),
        }
    }

    pub fn visible_mut(&mut self, handle: Handle) -> AnvilResult<&mut TensorRecord> {
        match self.records.get_mut(&handle) {
            Some(record) if !record.retired => Ok(record),
            _ => Err(AnvilError::InvalidHandle(handle)),
        }
    }

    /// A record that may still be used as an input or deleted
    pub fn open_mut(&mut self, handle: Handle) -> AnvilResult<&mut TensorRecord> {
        match self.records.get_mut(&handle) {
            Some(record) if !record.retired && !record.delete_requested => Ok(record),
            _ => Err(AnvilError::InvalidHandle(handle)),
        }
    }

    /// Remove a record that never became visible, undoing its input references
    pub fn discard(&mut self, handle: Handle) {
        if let Some(record) = self.records.remove(&handle) {
            if let Some(path) = record.path {
                for input in path.inputs {
                    if let Some(r) = self.records.get_mut(&input) {
                        r.path_refs = r.path_refs.saturating_sub(1);
                    }
                }
            }
        }
    }

    /// A queued apply that read `handle` has been processed
    pub fn release_use(&mut self, handle: Handle) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.pending_uses = record.pending_uses.saturating_sub(1);
        }
        self.reclaim(handle);
    }

    /// Process a delete: hide the record and reclaim it once unreferenced
    pub fn retire(&mut self, handle: Handle) {
        if let Some(record) = self.records.get_mut(&handle) {
            record.retired = true;
        }
        self.reclaim(handle);
    }

    /// Remove `handle` if nothing refers to it, then cascade to records only
    /// its computing path kept alive.
    pub fn reclaim(&mut self, handle: Handle) {
        let mut worklist = vec![handle];
        while let Some(h) = worklist.pop() {
            let reclaimable = self.records.get(&h).map_or(false, |r| r.reclaimable());
            if !reclaimable {
                continue;
            }
            let Some(record) = self.records.remove(&h) else {
                continue;
            };
            tracing::trace!(handle = %h, "record reclaimed");
            if let Some(path) = record.path {
                for input in path.inputs {
                    if let Some(r) = self.records.get_mut(&input) {
                        r.path_refs = r.path_refs.saturating_sub(1);
                        worklist.push(input);
                    }
                }
            }
        }
    }

    /// Records visible to callers, by lifecycle state
    pub fn count_states(&self) -> HashMap<TensorState, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values().filter(|r| !r.retired) {
            *counts.entry(record.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Records held in the table, including retired ones kept for recomputation
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::memory::MemoryTracker;
    use crate::ops::{Elemwise, ElemwiseMode};
    use crate::interpreter::record::{ComputePath, Resident};
    use crate::tensor::{Device, DeviceTensor, HostTensor};

    fn ready(tracker: &Arc<MemoryTracker>) -> TensorRecord {
        let host = HostTensor::from_f32([1], vec![1.0]).unwrap();
        let dev = DeviceTensor::from_host(&host, Device::Cpu);
        let guard = tracker.allocate(dev.nbytes());
        TensorRecord::ready(dev.meta(), Resident::new(dev, guard), Some(host))
    }

    #[test]
    fn test_handles_are_never_reused() {
        let tracker = MemoryTracker::new();
        let mut table = HandleTable::new();
        let a = table.insert(ready(&tracker));
        table.retire(a);
        let b = table.insert(ready(&tracker));
        assert_ne!(a, b);
        assert!(table.visible(a).is_err());
        assert!(table.visible(b).is_ok());
    }

    #[test]
    fn test_tables_share_the_id_space() {
        let tracker = MemoryTracker::new();
        let mut first = HandleTable::new();
        let mut second = HandleTable::new();
        let a = first.insert(ready(&tracker));
        let b = second.insert(ready(&tracker));
        assert_ne!(a, b);
        assert!(second.visible(a).is_err());
        assert!(first.visible(b).is_err());
    }

    #[test]
    fn test_retire_defers_while_in_use() {
        let tracker = MemoryTracker::new();
        let mut table = HandleTable::new();
        let a = table.insert(ready(&tracker));
        table.get_mut(a).unwrap().pending_uses = 1;

        table.retire(a);
        assert!(table.visible(a).is_err());
        assert!(table.get(a).is_some());
        assert_eq!(tracker.stats().in_use, 4);

        table.release_use(a);
        assert!(table.get(a).is_none());
        assert_eq!(tracker.stats().in_use, 0);
    }

    #[test]
    fn test_computing_path_keeps_inputs_alive() {
        let tracker = MemoryTracker::new();
        let mut table = HandleTable::new();
        let a = table.insert(ready(&tracker));
        let path = ComputePath {
            op: Arc::new(Elemwise::new(ElemwiseMode::Relu)),
            inputs: vec![a],
            output_index: 0,
        };
        table.get_mut(a).unwrap().path_refs += 1;
        let b = table.insert(TensorRecord::pending(None, Some(path)));

        table.retire(a);
        assert!(table.get(a).is_some());

        table.retire(b);
        assert!(table.is_empty());
    }

    #[test]
    fn test_open_mut_rejects_delete_requested() {
        let tracker = MemoryTracker::new();
        let mut table = HandleTable::new();
        let a = table.insert(ready(&tracker));
        table.open_mut(a).unwrap().delete_requested = true;
        assert!(matches!(table.open_mut(a), Err(AnvilError::InvalidHandle(h)) if h == a));
        assert!(table.visible(a).is_ok());
    }
}
