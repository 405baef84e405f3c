//! A bidirectional request/reply channel coupling a master thread with a
//! worker thread.
//!
//! Bulk data moves through lock-free single-producer single-consumer lanes;
//! a separate control lane carries small fixed-size records and wakes the
//! receiving thread at most once per batch. Signal heuristics keep wakeups
//! rare under steady traffic while guaranteeing the peer is never left
//! asleep with work pending.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod queue;
pub mod time;
pub mod waker;

pub use channel::{
    create, ChannelEvent, ChannelId, ChannelState, EndpointStats, MasterChannel, SendError,
    WorkerChannel,
};
pub use config::Config;
pub use control::{control_plane, ControlReceiver, ControlRecord, ControlSender, ControlSignal};
pub use error::{Error, Result};
pub use message::Message;
pub use queue::{atomic_queue, Consumer, Producer};
pub use time::{Duration, Instant};
pub use waker::{CountingWaker, NoopWaker, Waker};

#[cfg(feature = "std")]
pub use time::Clock;
#[cfg(feature = "std")]
pub use waker::ThreadWaker;

/// Capacity of the bulk lanes, in messages.
///
/// The reader must service its lane at inter-message latency; sizing the
/// lane high costs memory, sizing it low makes the writer fail. Erring on
/// the high side is the cheaper mistake.
pub const ATOMIC_QUEUE_SIZE: usize = 1024;

/// Capacity of a thread's control lane, in records.
pub const CONTROL_QUEUE_SIZE: usize = 1024;

/// Minimum interval between wakeup signals to a peer believed to be awake.
pub const DEFAULT_SIGNAL_INTERVAL: Duration = Duration::from_millis(1);

/// Unacknowledged-send lag above which a signal is always sent.
pub const DEFAULT_ACK_LAG_THRESHOLD: u64 = 1000;

/// Inverse alpha of the fixed-point exponential moving average.
pub const DEFAULT_IALPHA: u64 = 8;
