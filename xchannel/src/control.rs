//! Control lane: fixed-size records plus a coalesced wakeup.
//!
//! Each event-loop thread owns one control lane. Any endpoint that needs to
//! signal that thread clones a [`ControlSender`]; the owning thread drains
//! records through its unique [`ControlReceiver`]. The lane is therefore
//! multi-producer single-consumer, unlike the bulk lanes.
//!
//! Sends wake the consumer **at most once per coalesced batch**: the first
//! record after a drain pokes the thread's [`Waker`], later records ride
//! along until the consumer acknowledges the wakeup.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::channel::ChannelId;
use crate::error::{Error, Result};
use crate::waker::Waker;

/// A signal carried on the control lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Something went wrong on the sending side.
    Error,

    /// New requests are queued toward the worker.
    DataToWorker,

    /// New replies are queued toward the master.
    DataFromWorker,

    /// A freshly created channel is being handed to the worker thread.
    Open,

    /// The sending side is closing the channel.
    Close,

    /// The worker replied to its last outstanding request.
    DataDoneWorker,

    /// The worker is entering its idle loop with requests still pending.
    WorkerSleeping,
}

/// One control-lane record, copied by value.
#[derive(Debug, Clone, Copy)]
pub struct ControlRecord {
    /// The signal to deliver.
    pub signal: ControlSignal,

    /// The sending endpoint's ack at signal time. CLOSE records carry the
    /// closing side's role tag here instead (0 master, 1 worker).
    pub ack: u64,

    /// The channel the record refers to, resolved through the host's
    /// channel table.
    pub channel: ChannelId,
}

/// A ring slot stamped with the index it expects next.
///
/// A producer may write the slot when `stamp` equals its ticket; the
/// consumer may read it when `stamp` is one past the head. This is the
/// bounded-queue stamp protocol that lets multiple producers race on the
/// tail without corrupting slots.
struct Slot {
    stamp: AtomicUsize,
    record: UnsafeCell<MaybeUninit<ControlRecord>>,
}

struct Inner {
    /// Next slot to read. Written only by the consumer.
    head: CachePadded<AtomicUsize>,

    /// Next ticket to claim. Producers race with compare-exchange.
    tail: CachePadded<AtomicUsize>,

    /// Set while a wakeup is pending; cleared by the consumer's
    /// acknowledge before it drains.
    signalled: AtomicBool,

    mask: usize,
    slots: Box<[Slot]>,
    waker: Arc<dyn Waker>,
}

// SAFETY: slot access is serialized by the stamp protocol; a slot is
// writable by exactly the producer holding its ticket and readable by the
// consumer only after the producer's Release store of the stamp.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Creates a control lane for one consumer thread.
///
/// `capacity` is rounded up to a power of two. `waker` is poked on the
/// first record of each batch.
pub fn control_plane(capacity: usize, waker: Arc<dyn Waker>) -> (ControlSender, ControlReceiver) {
    assert!(capacity >= 2, "control capacity must be at least 2");

    let capacity = capacity.next_power_of_two();
    let mut slots = Vec::with_capacity(capacity);
    for i in 0..capacity {
        slots.push(Slot {
            stamp: AtomicUsize::new(i),
            record: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }

    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        signalled: AtomicBool::new(false),
        mask: capacity - 1,
        slots: slots.into_boxed_slice(),
        waker,
    });

    (
        ControlSender {
            inner: Arc::clone(&inner),
        },
        ControlReceiver { inner },
    )
}

/// The write half of a control lane. Cloneable; one per signalling endpoint.
#[derive(Clone)]
pub struct ControlSender {
    inner: Arc<Inner>,
}

impl ControlSender {
    /// Publishes a record and wakes the consumer if it has not been woken
    /// since its last drain.
    ///
    /// Fails with [`Error::ControlFull`] when the lane is full; the caller
    /// does not retry.
    pub fn send(&self, record: ControlRecord) -> Result<()> {
        let inner = &*self.inner;

        let mut tail = inner.tail.load(Ordering::Relaxed);
        loop {
            let slot = &inner.slots[tail & inner.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == tail {
                match inner.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Ticket claimed; the slot is ours until the stamp
                        // publishes it to the consumer.
                        unsafe {
                            (*slot.record.get()).write(record);
                        }
                        slot.stamp.store(tail.wrapping_add(1), Ordering::Release);
                        break;
                    }
                    Err(current) => tail = current,
                }
            } else if (stamp.wrapping_sub(tail) as isize) < 0 {
                // The slot still holds a record from one lap ago.
                return Err(Error::ControlFull);
            } else {
                tail = inner.tail.load(Ordering::Relaxed);
            }
        }

        if !inner.signalled.swap(true, Ordering::SeqCst) {
            inner.waker.wake();
        }
        Ok(())
    }
}

/// The read half of a control lane, owned by the consumer thread.
pub struct ControlReceiver {
    inner: Arc<Inner>,
}

impl ControlReceiver {
    /// Acknowledges a wakeup and returns the number of records pending.
    ///
    /// Returns `0` for a spurious wakeup (nothing queued). Must be called
    /// before draining so that a record published mid-drain re-arms the
    /// waker rather than being lost.
    pub fn acknowledge(&mut self) -> usize {
        self.inner.signalled.store(false, Ordering::SeqCst);
        self.len()
    }

    /// Removes the oldest record, if any. Never blocks.
    pub fn pop(&mut self) -> Option<ControlRecord> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let slot = &inner.slots[head & inner.mask];

        if slot.stamp.load(Ordering::Acquire) != head.wrapping_add(1) {
            return None;
        }

        // SAFETY: the stamp says the producer finished writing this slot
        // and no other consumer exists.
        let record = unsafe { (*slot.record.get()).assume_init_read() };
        slot.stamp
            .store(head.wrapping_add(inner.mask).wrapping_add(1), Ordering::Release);
        inner.head.store(head.wrapping_add(1), Ordering::Relaxed);
        Some(record)
    }

    /// Returns the number of queued records (approximate while producers
    /// are active).
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Returns true if the lane appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waker::{CountingWaker, NoopWaker};

    fn record(signal: ControlSignal, ack: u64) -> ControlRecord {
        ControlRecord {
            signal,
            ack,
            channel: ChannelId::new(7),
        }
    }

    #[test]
    fn test_send_pop_roundtrip() {
        let (tx, mut rx) = control_plane(16, Arc::new(NoopWaker::new()));

        tx.send(record(ControlSignal::DataToWorker, 42)).unwrap();

        let popped = rx.pop().unwrap();
        assert_eq!(popped.signal, ControlSignal::DataToWorker);
        assert_eq!(popped.ack, 42);
        assert_eq!(popped.channel, ChannelId::new(7));
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_full_lane_rejects() {
        let (tx, mut rx) = control_plane(4, Arc::new(NoopWaker::new()));

        for i in 0..4 {
            tx.send(record(ControlSignal::DataToWorker, i)).unwrap();
        }
        assert_eq!(
            tx.send(record(ControlSignal::DataToWorker, 99)),
            Err(Error::ControlFull)
        );

        assert_eq!(rx.pop().unwrap().ack, 0);
        tx.send(record(ControlSignal::DataToWorker, 99)).unwrap();
    }

    #[test]
    fn test_wake_coalesces_per_batch() {
        let waker = Arc::new(CountingWaker::new());
        let (tx, mut rx) = control_plane(16, waker.clone());

        for i in 0..5 {
            tx.send(record(ControlSignal::DataToWorker, i)).unwrap();
        }
        assert_eq!(waker.count(), 1);

        assert_eq!(rx.acknowledge(), 5);
        while rx.pop().is_some() {}

        tx.send(record(ControlSignal::DataToWorker, 5)).unwrap();
        assert_eq!(waker.count(), 2);
    }

    #[test]
    fn test_acknowledge_empty_is_sentinel() {
        let (_tx, mut rx) = control_plane(16, Arc::new(NoopWaker::new()));
        assert_eq!(rx.acknowledge(), 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_multiple_producers() {
        const PER_PRODUCER: u64 = 1000;
        const PRODUCERS: u64 = 4;

        let (tx, mut rx) = control_plane(8192, Arc::new(NoopWaker::new()));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.send(record(ControlSignal::DataToWorker, p * PER_PRODUCER + i))
                            .unwrap();
                    }
                })
            })
            .collect();

        let mut seen = 0;
        let mut last_per_producer = [None::<u64>; PRODUCERS as usize];
        while seen < PER_PRODUCER * PRODUCERS {
            match rx.pop() {
                Some(rec) => {
                    let producer = (rec.ack / PER_PRODUCER) as usize;
                    let index = rec.ack % PER_PRODUCER;
                    // Records from one producer arrive in its send order.
                    if let Some(last) = last_per_producer[producer] {
                        assert!(index > last);
                    }
                    last_per_producer[producer] = Some(index);
                    seen += 1;
                }
                None => std::thread::yield_now(),
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(rx.is_empty());
    }
}
