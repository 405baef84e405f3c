//! Configuration for channel tuning.
//!
//! The tunables govern the signal elision heuristic and lane sizing; the
//! defaults match a high-throughput server handing ~1M messages/sec per
//! channel pair.

use crate::time::Duration;
use crate::{ATOMIC_QUEUE_SIZE, DEFAULT_ACK_LAG_THRESHOLD, DEFAULT_IALPHA, DEFAULT_SIGNAL_INTERVAL};

/// Configuration for a channel.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Minimum interval between wakeup signals to a peer believed to be
    /// awake (default: 1ms).
    pub signal_interval: Duration,

    /// Unacknowledged-send lag above which a signal is always sent
    /// (default: 1000).
    pub ack_lag_threshold: u64,

    /// Inverse alpha of the fixed-point moving average used for message
    /// intervals and processing time (default: 8).
    pub ialpha: u64,

    /// Bulk lane capacity in messages, rounded up to a power of two
    /// (default: 1024).
    pub queue_size: usize,

    /// Elide a signal whenever an earlier signal has not been acked yet.
    ///
    /// Sound only when the wakeup primitive guarantees an unconsumed
    /// wakeup stays pending until the peer services it. Off by default.
    pub assume_signal_coalescing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Creates a configuration with default values.
    pub const fn new() -> Self {
        Self {
            signal_interval: DEFAULT_SIGNAL_INTERVAL,
            ack_lag_threshold: DEFAULT_ACK_LAG_THRESHOLD,
            ialpha: DEFAULT_IALPHA,
            queue_size: ATOMIC_QUEUE_SIZE,
            assume_signal_coalescing: false,
        }
    }

    /// Sets the minimum interval between signals to an active peer.
    pub const fn with_signal_interval(mut self, interval: Duration) -> Self {
        self.signal_interval = interval;
        self
    }

    /// Sets the ack lag above which signals become mandatory.
    pub const fn with_ack_lag_threshold(mut self, threshold: u64) -> Self {
        self.ack_lag_threshold = threshold;
        self
    }

    /// Sets the inverse alpha of the moving average.
    ///
    /// # Panics
    ///
    /// Panics if `ialpha` is zero.
    pub const fn with_ialpha(mut self, ialpha: u64) -> Self {
        assert!(ialpha >= 1, "ialpha must be at least 1");
        self.ialpha = ialpha;
        self
    }

    /// Sets the bulk lane capacity in messages.
    ///
    /// # Panics
    ///
    /// Panics if `size` is smaller than 2.
    pub const fn with_queue_size(mut self, size: usize) -> Self {
        assert!(size >= 2, "queue_size must be at least 2");
        self.queue_size = size;
        self
    }

    /// Enables or disables the coalesced-signal elision refinement.
    pub const fn with_signal_coalescing(mut self, enable: bool) -> Self {
        self.assume_signal_coalescing = enable;
        self
    }
}
