//! Lock-free metric ring buffer.
//!
//! A bounded multi-producer queue sitting between the request hot path and
//! the background writer. Producers never block and never take a lock: a slot
//! is claimed with a CAS on the write cursor, filled, then published by
//! advancing the ready cursor in claim order. When the buffer is full,
//! `publish` drops the event and counts it — back-pressure must never reach
//! the request path.
//!
//! Draining is the writer's job. A single internal mutex serializes
//! consumers (the writer's flush lock already does this in practice; the
//! extra lock keeps direct misuse safe) and is never touched by `publish`.

use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum capacity regardless of the requested size.
pub const MIN_CAPACITY: usize = 64;

/// A bounded MPMC queue with non-blocking, drop-counting publication.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Next sequence to claim. Slots in `[ready, write)` are being filled.
    write: AtomicU64,
    /// Sequences below this are fully published and visible to `drain`.
    ready: AtomicU64,
    /// Next sequence to consume. Slots in `[read, ready)` hold events.
    read: AtomicU64,
    dropped: AtomicU64,
    drain_lock: Mutex<()>,
}

struct Slot<T>(UnsafeCell<Option<T>>);

// SAFETY: each slot is accessed exclusively by one thread at a time. The
// cursor protocol hands a slot at sequence `s` first to the single producer
// that won the CAS for `s` (until `ready` passes `s`), then to the single
// consumer holding `drain_lock` (until `read` passes `s`). The slot cannot
// be reclaimed by a producer before the consumer advances `read`, because
// claims are bounded by `write - read < capacity`.
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a buffer with the given requested capacity.
    ///
    /// The actual capacity is a power of two (values between powers round
    /// down), with a floor of [`MIN_CAPACITY`]. The backing array is sized
    /// once here and never reallocated.
    pub fn new(requested: usize) -> Self {
        let capacity = Self::effective_capacity(requested);
        let slots = (0..capacity)
            .map(|_| Slot(UnsafeCell::new(None)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: (capacity - 1) as u64,
            write: AtomicU64::new(0),
            ready: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
        }
    }

    fn effective_capacity(requested: usize) -> usize {
        if requested <= MIN_CAPACITY {
            return MIN_CAPACITY;
        }
        if requested.is_power_of_two() {
            requested
        } else {
            // Round down to the previous power of two.
            requested.next_power_of_two() / 2
        }
    }

    /// Publish an event. Returns `false` (and counts a drop) when full.
    ///
    /// Never blocks; the only loop is the CAS retry under contention and the
    /// bounded spin that publishes claimed slots in claim order.
    pub fn publish(&self, event: T) -> bool {
        let capacity = self.slots.len() as u64;
        let mut w = self.write.load(Ordering::Acquire);
        loop {
            let r = self.read.load(Ordering::Acquire);
            if w.wrapping_sub(r) >= capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            match self
                .write
                .compare_exchange_weak(w, w + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => w = current,
            }
        }

        // SAFETY: we won the CAS for sequence `w`, so this slot is ours until
        // we advance `ready` past it. `ready <= w` here, so no consumer can
        // observe the slot yet.
        unsafe {
            *self.slots[(w & self.mask) as usize].0.get() = Some(event);
        }

        // Publish in claim order: wait for earlier claimants to finish so
        // consumers never observe a gap.
        while self
            .ready
            .compare_exchange_weak(w, w + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        true
    }

    /// Remove and return up to `max_batch` events in publication order.
    ///
    /// Returns an empty vec when the buffer is empty. Consumers are
    /// serialized internally; `publish` is unaffected.
    pub fn drain(&self, max_batch: usize) -> Vec<T> {
        let _guard = self
            .drain_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let ready = self.ready.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        let available = ready.wrapping_sub(read) as usize;
        let count = available.min(max_batch);
        let mut out = Vec::with_capacity(count);

        for seq in read..read + count as u64 {
            // SAFETY: `seq < ready` so the producing thread has fully
            // published this slot, and we hold `drain_lock` so no other
            // consumer touches it. Taking the value nulls the slot for reuse.
            let taken = unsafe { (*self.slots[(seq & self.mask) as usize].0.get()).take() };
            if let Some(event) = taken {
                out.push(event);
            }
        }

        self.read.store(read + count as u64, Ordering::Release);
        out
    }

    /// Approximate number of buffered events. Non-authoritative while
    /// producers or the consumer are active.
    pub fn size(&self) -> usize {
        let ready = self.ready.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        ready.saturating_sub(read) as usize
    }

    /// Fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Best-effort fill percentage in `[0, 100]`.
    pub fn usage_percent(&self) -> f64 {
        (self.size() as f64 / self.capacity() as f64) * 100.0
    }

    /// Cumulative count of events rejected due to overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}
