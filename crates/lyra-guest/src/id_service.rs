//! Shared allocation-id allocation.
//!
//! `alloc_id` values must be unique per logical device across every producer
//! that can reference the same allocations, because the device resolves
//! command references through them. This service hands out monotonic
//! nonzero ids from one counter per device key, with an explicit lifecycle:
//! the first opener creates the counter, handles are reference counted, and
//! the counter is torn down when the last handle drops. A cross-process
//! backing (shared mapping, broker) can implement the same interface; the
//! lifecycle contract is the point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("allocation id space exhausted")]
pub struct IdSpaceExhausted;

#[derive(Debug)]
struct IdCounter {
    next: AtomicU32,
}

impl IdCounter {
    fn allocate(&self) -> Result<u32, IdSpaceExhausted> {
        // Never hand out 0 (reserved) and never wrap into reuse.
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            if current == u32::MAX {
                return Err(IdSpaceExhausted);
            }
            match self.next.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return Ok(prev),
                Err(observed) => current = observed,
            }
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Weak<IdCounter>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<IdCounter>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle to one device's id counter. Clone freely; the counter lives while
/// any handle does.
#[derive(Clone, Debug)]
pub struct AllocIdHandle {
    counter: Arc<IdCounter>,
}

impl AllocIdHandle {
    pub fn allocate(&self) -> Result<u32, IdSpaceExhausted> {
        self.counter.allocate()
    }
}

pub struct AllocIdService;

impl AllocIdService {
    /// Open (creating on first open) the allocator for `device_key`.
    pub fn open(device_key: &str) -> AllocIdHandle {
        let mut reg = registry().lock().unwrap();
        // Prune entries whose last handle is gone; their id space restarts,
        // which is correct: no live producer can hold stale ids.
        reg.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = reg.get(device_key).and_then(Weak::upgrade) {
            return AllocIdHandle { counter: existing };
        }
        let counter = Arc::new(IdCounter {
            next: AtomicU32::new(1),
        });
        reg.insert(device_key.to_owned(), Arc::downgrade(&counter));
        AllocIdHandle { counter }
    }
}
