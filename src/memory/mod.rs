//! Accounting for device storage held by the handle table

use std::sync::Arc;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub in_use: usize,
    pub peak: usize,
}

/// Counts bytes of device values currently retained by records
#[derive(Debug, Default)]
pub struct MemoryTracker {
    stats: Mutex<MemoryStats>,
}

impl MemoryTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve `size` bytes; they are returned when the guard is dropped
    pub fn allocate(self: &Arc<Self>, size: usize) -> MemoryGuard {
        {
            let mut stats = self.stats.lock();
            stats.in_use += size;
            stats.peak = stats.peak.max(stats.in_use);
        }
        MemoryGuard::new(size, self.clone())
    }

    fn deallocate(&self, size: usize) {
        let mut stats = self.stats.lock();
        stats.in_use = stats.in_use.saturating_sub(size);
    }

    pub fn stats(&self) -> MemoryStats {
        *self.stats.lock()
    }
}

#[derive(Debug)]
pub struct MemoryGuard {
    size: usize,
    tracker: Arc<MemoryTracker>,
}

impl MemoryGuard {
    fn new(size: usize, tracker: Arc<MemoryTracker>) -> Self {
        Self { size, tracker }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.tracker.deallocate(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = MemoryTracker::new();
        let a = tracker.allocate(100);
        let b = tracker.allocate(28);
        assert_eq!(tracker.stats().in_use, 128);

        drop(a);
        assert_eq!(tracker.stats(), MemoryStats { in_use: 28, peak: 128 });
        assert_eq!(b.size(), 28);

        drop(b);
        assert_eq!(tracker.stats().in_use, 0);
    }
}
