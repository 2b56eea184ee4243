//! Reuse of device storage for repeated small `put` values

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::memory::{MemoryGuard, MemoryTracker};
use crate::tensor::{Device, DeviceTensor, HostTensor};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CandidateKey {
    device: Device,
    digest: u64,
}

#[derive(Debug)]
struct Candidate {
    key: CandidateKey,
    host: HostTensor,
    value: DeviceTensor,
    /// Reservation shared by the records currently holding `value`
    charge: Weak<MemoryGuard>,
}

/// Bounded FIFO of recently uploaded host values
#[derive(Debug, Default)]
pub struct CandidateCache {
    entries: VecDeque<Candidate>,
    hits: u64,
}

impl CandidateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a device value for `host` and its memory reservation, sharing
    /// both with an earlier identical upload when one is cached.
    ///
    /// The cache itself does not hold a reservation, so storage it keeps
    /// alive after every record using it is gone is not counted.
    pub fn upload(
        &mut self,
        host: &HostTensor,
        device: Device,
        capacity: usize,
        memory: &Arc<MemoryTracker>,
    ) -> (DeviceTensor, Arc<MemoryGuard>) {
        if capacity == 0 {
            let value = DeviceTensor::from_host(host, device);
            let charge = Arc::new(memory.allocate(value.nbytes()));
            return (value, charge);
        }
        let key = CandidateKey {
            device,
            digest: digest(host),
        };
        if let Some(hit) = self
            .entries
            .iter_mut()
            .find(|c| c.key == key && c.host == *host)
        {
            self.hits += 1;
            let charge = match hit.charge.upgrade() {
                Some(charge) => charge,
                None => {
                    let charge = Arc::new(memory.allocate(hit.value.nbytes()));
                    hit.charge = Arc::downgrade(&charge);
                    charge
                }
            };
            return (hit.value.clone(), charge);
        }

        let value = DeviceTensor::from_host(host, device);
        let charge = Arc::new(memory.allocate(value.nbytes()));
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Candidate {
            key,
            host: host.clone(),
            value: value.clone(),
            charge: Arc::downgrade(&charge),
        });
        (value, charge)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

fn digest(host: &HostTensor) -> u64 {
    let mut hasher = DefaultHasher::new();
    host.shape().hash(&mut hasher);
    host.data().hash_bits(&mut hasher);
    hasher.finish()
}
