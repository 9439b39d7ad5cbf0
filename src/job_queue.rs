//! A lock-free, fixed-capacity, multi-producer multi-consumer FIFO of
//! fixed-size job records (a Michael-Scott queue), used by the resource
//! manager to hand work to its worker threads.
//!
//! Node identity in the linked list is a [`crate::slot_allocator::SlotHandle`]
//! rather than a raw pointer: the slot half indexes into a fixed slab, and the
//! refcount half makes a stale `compare_exchange` on a freed-and-reused slot
//! fail instead of silently succeeding (the classic ABA problem pointer-based
//! Michael-Scott queues solve with hazard pointers or epochs, solved here by
//! reusing the allocator's own ABA-safe handles).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::slot_allocator::{SlotAllocator, SlotHandle};

const NONE: SlotHandle = u64::MAX;

/// Items enqueued on a [`JobQueue`] must be able to identify and produce a
/// `Quit` sentinel, so the queue can implement the re-post-on-quit
/// cancellation protocol without knowing the concrete job payload.
pub trait QueueItem: Clone + Default {
    fn is_quit(&self) -> bool;
    fn quit() -> Self;
}

struct Slot<T> {
    job: Mutex<T>,
    next: AtomicU64,
}

/// A counting semaphore used to implement the job queue's optional blocking
/// `next()`: one permit per posted job, handed off through an unbounded
/// `crossbeam_channel` rather than a hand-rolled `Condvar` wait loop.
struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    fn release(&self) {
        // Unbounded sender to a receiver we also own: never disconnects.
        let _ = self.tx.send(());
    }

    fn acquire(&self) {
        let _ = self.rx.recv();
    }
}

/// Fixed-capacity lock-free MPMC job queue.
pub struct JobQueue<T: QueueItem> {
    slots: Vec<Slot<T>>,
    allocator: SlotAllocator,
    head: AtomicU64,
    tail: AtomicU64,
    blocking: bool,
    semaphore: Semaphore,
}

impl<T: QueueItem> JobQueue<T> {
    /// Construct a queue with `capacity` job slots. When `blocking` is true,
    /// `next()` parks the calling thread on an internal semaphore instead of
    /// returning `NoDataAvailable` while empty.
    pub fn new(capacity: usize, blocking: bool) -> Self {
        let allocator = SlotAllocator::new(capacity);
        let slots: Vec<Slot<T>> = (0..capacity)
            .map(|_| Slot {
                job: Mutex::new(T::default()),
                next: AtomicU64::new(NONE),
            })
            .collect();

        // Allocate the free-standing dummy head from slot 0.
        let dummy = allocator.alloc().expect("fresh allocator has capacity");

        Self {
            slots,
            allocator,
            head: AtomicU64::new(dummy),
            tail: AtomicU64::new(dummy),
            blocking,
            semaphore: Semaphore::new(),
        }
    }

    fn slot(&self, handle: SlotHandle) -> &Slot<T> {
        &self.slots[SlotAllocator::handle_slot(handle)]
    }

    /// Enqueue a job. Fails with `OutOfMemory` if the slab is exhausted.
    pub fn post(&self, job: T) -> Result<()> {
        let handle = self.allocator.alloc()?;
        {
            let slot = self.slot(handle);
            *slot.job.lock().unwrap() = job;
            slot.next.store(NONE, Ordering::Release);
        }

        loop {
            let tail_handle = self.tail.load(Ordering::Acquire);
            let tail_slot = self.slot(tail_handle);
            let tail_next = tail_slot.next.load(Ordering::Acquire);

            if tail_next == NONE {
                if tail_slot
                    .next
                    .compare_exchange(NONE, handle, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // best-effort tail advance; another thread may beat us to it
                    let _ = self.tail.compare_exchange(
                        tail_handle,
                        handle,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    break;
                }
            } else {
                // tail is lagging behind the real end of the list; help it along
                let _ = self.tail.compare_exchange(
                    tail_handle,
                    tail_next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }

        if self.blocking {
            self.semaphore.release();
        }

        Ok(())
    }

    /// Dequeue the next job. In blocking mode, parks until one is available.
    /// In non-blocking mode, returns `NoDataAvailable` immediately when
    /// empty. Returns `Cancelled` (after re-posting the sentinel for sibling
    /// workers) when a `Quit` job is observed.
    pub fn next(&self) -> Result<T> {
        if self.blocking {
            self.semaphore.acquire();
        }

        loop {
            let head_handle = self.head.load(Ordering::Acquire);
            let tail_handle = self.tail.load(Ordering::Acquire);
            let head_slot = self.slot(head_handle);
            let next_handle = head_slot.next.load(Ordering::Acquire);

            if head_handle == tail_handle {
                if next_handle == NONE {
                    if self.blocking {
                        // Spurious: another thread already drained the item that
                        // released our semaphore permit. Re-check.
                        continue;
                    }
                    return Err(Error::NoDataAvailable);
                }
                // tail lags the list; help it catch up and retry
                let _ = self.tail.compare_exchange(
                    tail_handle,
                    next_handle,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            if next_handle == NONE {
                // Another thread is mid-enqueue; retry.
                continue;
            }

            let job = self.slot(next_handle).job.lock().unwrap().clone();

            if self
                .head
                .compare_exchange(head_handle, next_handle, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = self.allocator.free(head_handle);

                if job.is_quit() {
                    // Re-post so sibling workers also observe termination.
                    let _ = self.post(T::quit());
                    return Err(Error::Cancelled);
                }
                return Ok(job);
            }
        }
    }
}
