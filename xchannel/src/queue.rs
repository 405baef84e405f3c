//! Bounded lock-free queue for bulk message transfer.
//!
//! One producer thread, one consumer thread. The split [`Producer`] and
//! [`Consumer`] halves make that discipline a compile-time property: each
//! half is `Send` but cannot be cloned, so at most one thread can hold the
//! write side and one the read side.
//!
//! Both operations are wait-free: `push` fails rather than blocks when the
//! queue is full, handing the value back to the caller.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Shared ring storage. Indices grow without bound; the slot is the index
/// masked by the power-of-two capacity.
struct Inner<T> {
    /// Next slot to read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,

    /// Next slot to write. Written only by the producer.
    tail: CachePadded<AtomicUsize>,

    /// Capacity mask (capacity - 1).
    mask: usize,

    /// Slot storage. A slot holds a live `T` iff its index is in
    /// `head..tail`.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is written only by the producer before it publishes `tail`
// (Release) and read only by the consumer after it observes that `tail`
// (Acquire), so no slot is ever accessed from two threads at once.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Both handles are gone, so the indices are quiescent.
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();

        while head != tail {
            unsafe {
                (*self.slots[head & self.mask].get()).assume_init_drop();
            }
            head = head.wrapping_add(1);
        }
    }
}

/// Creates a bounded single-producer single-consumer queue.
///
/// `capacity` is rounded up to a power of two.
pub fn atomic_queue<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "queue capacity must be at least 2");

    let capacity = capacity.next_power_of_two();
    let mut slots = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        slots.push(UnsafeCell::new(MaybeUninit::uninit()));
    }

    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        mask: capacity - 1,
        slots: slots.into_boxed_slice(),
    });

    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

/// The write half of a bulk lane.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Producer<T> {
    /// Appends a value to the queue.
    ///
    /// Returns the value back when the queue is full. Never blocks.
    pub fn push(&mut self, value: T) -> core::result::Result<(), T> {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == inner.slots.len() {
            return Err(value);
        }

        // SAFETY: the slot at `tail` is outside `head..tail`, so the
        // consumer will not touch it until we publish the new tail.
        unsafe {
            (*inner.slots[tail & inner.mask].get()).write(value);
        }
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Returns the number of queued values (approximate from this side).
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Returns true if the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the queue capacity.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}

/// The read half of a bulk lane.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Consumer<T> {
    /// Removes the oldest value from the queue, if any. Never blocks.
    pub fn pop(&mut self) -> Option<T> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: `head < tail`, so the producer published this slot and
        // will not reuse it until we publish the new head.
        let value = unsafe { (*inner.slots[head & inner.mask].get()).assume_init_read() };
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Returns the number of queued values (approximate from this side).
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Returns true if the queue appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the queue capacity.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }
}
