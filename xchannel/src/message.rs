//! Messages passed through the bulk lanes.

use crate::time::{Duration, Instant};

/// A message moving through a channel.
///
/// The payload is opaque to the channel; the framing fields (`sequence`,
/// `ack`) are written by the channel on every send and read back on
/// receive. Replies additionally carry the worker's timing telemetry,
/// which the master folds into the channel's aggregate.
#[derive(Debug)]
pub struct Message<T> {
    /// Position in the sending direction's sequence space. Written by the
    /// channel on send.
    pub sequence: u64,

    /// The sender's ack at send time. Written by the channel on send.
    pub ack: u64,

    /// Send timestamp. Must not decrease across sends on one endpoint.
    pub when: Instant,

    /// Time the worker spent processing the request (replies only).
    pub processing_time: Duration,

    /// Worker CPU time consumed for this channel so far (replies only).
    pub cpu_time: Duration,

    /// The payload.
    pub payload: T,
}

impl<T> Message<T> {
    /// Creates a message with zeroed framing and telemetry.
    pub fn new(payload: T, when: Instant) -> Self {
        Self {
            sequence: 0,
            ack: 0,
            when,
            processing_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
            payload,
        }
    }

    /// Attaches reply telemetry.
    pub fn with_telemetry(mut self, processing_time: Duration, cpu_time: Duration) -> Self {
        self.processing_time = processing_time;
        self.cpu_time = cpu_time;
        self
    }
}
