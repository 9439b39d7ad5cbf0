//! Fixed-capacity index allocator with per-slot reference counts, giving out
//! ABA-safe handles: two `alloc()` calls that happen to reuse the same slot
//! index are guaranteed to produce distinct handles, because the refcount
//! half of the handle only ever increases.

use std::sync::atomic::{AtomicU32, Ordering};

const BITS_PER_GROUP: usize = 32;
const MAX_ALLOC_ATTEMPTS: usize = 2;

/// A 64-bit handle encoding `(refcount << 32) | slot`.
pub type SlotHandle = u64;

/// Fixed-capacity bitfield allocator. `capacity` slots are available for the
/// lifetime of the allocator; there is no growth.
pub struct SlotAllocator {
    groups: Vec<AtomicU32>,
    refcounts: Vec<AtomicU32>,
    capacity: usize,
    allocated: AtomicU32,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        let group_count = (capacity + BITS_PER_GROUP - 1) / BITS_PER_GROUP;
        Self {
            groups: (0..group_count).map(|_| AtomicU32::new(0)).collect(),
            refcounts: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            capacity,
            allocated: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Decompose a handle into its slot index and the refcount it was
    /// allocated under.
    pub fn handle_to_allocation(slot: usize, refcount: u32) -> SlotHandle {
        ((refcount as u64) << 32) | slot as u64
    }

    pub fn handle_slot(handle: SlotHandle) -> usize {
        (handle & 0xFFFF_FFFF) as usize
    }

    pub fn handle_refcount(handle: SlotHandle) -> u32 {
        (handle >> 32) as u32
    }

    /// Allocate a free slot, returning a handle composing the slot index with
    /// its post-increment refcount. Spins up to two passes over the groups,
    /// yielding the thread between passes, before giving up with
    /// `OutOfMemory`.
    pub fn alloc(&self) -> crate::error::Result<SlotHandle> {
        for attempt in 0..MAX_ALLOC_ATTEMPTS {
            if let Some(handle) = self.try_alloc_once() {
                return Ok(handle);
            }
            if attempt + 1 < MAX_ALLOC_ATTEMPTS {
                std::thread::yield_now();
            }
        }
        Err(crate::error::Error::OutOfMemory)
    }

    fn try_alloc_once(&self) -> Option<SlotHandle> {
        for (group_idx, group) in self.groups.iter().enumerate() {
            let mut current = group.load(Ordering::Acquire);
            loop {
                if current == u32::MAX {
                    break;
                }
                let bit = current.trailing_ones();
                let slot = group_idx * BITS_PER_GROUP + bit as usize;
                if slot >= self.capacity {
                    break;
                }
                let new = current | (1 << bit);
                match group.compare_exchange_weak(
                    current,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let refcount =
                            self.refcounts[slot].fetch_add(1, Ordering::AcqRel) + 1;
                        self.allocated.fetch_add(1, Ordering::AcqRel);
                        return Some(Self::handle_to_allocation(slot, refcount));
                    }
                    Err(observed) => {
                        current = observed;
                        continue;
                    }
                }
            }
        }
        None
    }

    /// Release a slot previously returned by `alloc`. Fails with
    /// `InvalidOperation` if the allocator currently has nothing allocated
    /// (defends against double-free of an already-drained allocator).
    pub fn free(&self, handle: SlotHandle) -> crate::error::Result<()> {
        let slot = Self::handle_slot(handle);
        if slot >= self.capacity {
            return Err(crate::error::Error::InvalidArgs);
        }

        if self.allocated.load(Ordering::Acquire) == 0 {
            return Err(crate::error::Error::InvalidOperation);
        }

        let group_idx = slot / BITS_PER_GROUP;
        let bit = slot % BITS_PER_GROUP;
        let mask = !(1u32 << bit);

        let group = &self.groups[group_idx];
        let mut current = group.load(Ordering::Acquire);
        loop {
            match group.compare_exchange_weak(
                current,
                current & mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.allocated.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn alloc_free_round_trip_preserves_empty_count() {
        let alloc = SlotAllocator::new(64);
        let mut handles = Vec::new();
        for _ in 0..64 {
            handles.push(alloc.alloc().unwrap());
        }
        assert!(alloc.alloc().is_err());
        for h in handles {
            alloc.free(h).unwrap();
        }
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn reused_slot_produces_distinct_handle() {
        let alloc = SlotAllocator::new(1);
        let h1 = alloc.alloc().unwrap();
        assert_eq!(SlotAllocator::handle_slot(h1), 0);
        alloc.free(h1).unwrap();
        let h2 = alloc.alloc().unwrap();
        assert_eq!(SlotAllocator::handle_slot(h2), 0);
        assert_ne!(h1, h2);
        assert_ne!(
            SlotAllocator::handle_refcount(h1),
            SlotAllocator::handle_refcount(h2)
        );
    }

    #[test]
    fn free_on_empty_allocator_is_invalid_operation() {
        let alloc = SlotAllocator::new(4);
        let err = alloc.free(0).unwrap_err();
        assert_eq!(err, crate::error::Error::InvalidOperation);
    }

    #[test]
    fn concurrent_alloc_never_double_issues_a_slot() {
        let alloc = Arc::new(SlotAllocator::new(256));
        let mut threads = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            threads.push(std::thread::spawn(move || {
                let mut local = Vec::new();
                for _ in 0..32 {
                    local.push(alloc.alloc().unwrap());
                }
                local
            }));
        }
        let mut all = Vec::new();
        for t in threads {
            all.extend(t.join().unwrap());
        }
        let mut slots: Vec<_> = all.iter().map(|&h| SlotAllocator::handle_slot(h)).collect();
        slots.sort_unstable();
        let before = slots.len();
        slots.dedup();
        assert_eq!(before, slots.len(), "no slot was issued twice concurrently");
    }
}
