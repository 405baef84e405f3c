//! Master side of a channel.
//!
//! The master sends requests, receives replies, and owns the channel-wide
//! processing-time aggregate the host's load balancer reads.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::config::Config;
use crate::control::{ControlReceiver, ControlRecord, ControlSender, ControlSignal};
use crate::error::Result;
use crate::message::Message;
use crate::queue::{Consumer, Producer};
use crate::time::{smooth, Duration, Instant};

use super::{
    ChannelEvent, ChannelId, ChannelState, Endpoint, EndpointStats, SendError, SendResult, Shared,
    CLOSE_FROM_MASTER,
};

/// The master-side handle of a channel.
///
/// `Send` but not `Clone`: exactly one thread drives this side, which is
/// what keeps the bulk lanes single-producer single-consumer.
pub struct MasterChannel<T> {
    shared: Arc<Shared>,
    config: Config,
    endpoint: Endpoint,
    state: ChannelState,
    peer_closed: bool,

    /// Control sender targeting the worker thread's lane.
    control: ControlSender,

    /// Outbound request lane.
    to_worker: Producer<Box<Message<T>>>,

    /// Inbound reply lane.
    from_worker: Consumer<Box<Message<T>>>,

    /// Smoothed worker-reported processing time.
    processing_time: Duration,

    /// Latest worker-reported CPU time.
    cpu_time: Duration,
}

impl<T> MasterChannel<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: Config,
        control: ControlSender,
        to_worker: Producer<Box<Message<T>>>,
        from_worker: Consumer<Box<Message<T>>>,
        now: Instant,
    ) -> Self {
        Self {
            shared,
            config,
            endpoint: Endpoint::new(now),
            state: ChannelState::Open,
            peer_closed: false,
            control,
            to_worker,
            from_worker,
            processing_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
        }
    }

    /// Returns the channel id.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Returns false once either side announced a close.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Returns this side's view of the channel lifecycle.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Sends a request to the worker.
    ///
    /// The message should be initialized except for `sequence` and `ack`,
    /// which this call assigns. Whatever the outcome, the caller must
    /// service the drained reply carried in the result, if any.
    ///
    /// On success the worker is woken unless it is demonstrably already
    /// processing the lane. On a full lane the message comes back along
    /// with one drained reply, and no state advances.
    pub fn send_request(&mut self, mut message: Box<Message<T>>) -> SendResult<T> {
        let when = message.when;
        let sequence = self.endpoint.sequence + 1;
        message.sequence = sequence;
        message.ack = self.endpoint.ack;

        if let Err(message) = self.to_worker.push(message) {
            log::debug!(
                "channel {}: request lane full at sequence {}",
                self.shared.id.raw(),
                sequence
            );
            let drained = self.recv_reply();
            return Err(SendError::Full { message, drained });
        }

        let was_idle = self.endpoint.outstanding == 0;
        self.endpoint.note_send(when, sequence, self.config.ialpha);
        self.endpoint.outstanding += 1;

        // The first in-flight message cannot have a reply yet; skip the
        // lane check.
        let drained = if was_idle { None } else { self.recv_reply() };

        if was_idle || self.endpoint.should_signal(when, &self.config) {
            if let Err(error) = self.data_ready(when, ControlSignal::DataToWorker) {
                return Err(SendError::Signal { error, drained });
            }
        }

        Ok(drained)
    }

    /// Receives one reply from the worker, if any. Never blocks.
    ///
    /// Ownership of the message passes to the caller. The reply's timing
    /// telemetry folds into the channel aggregate.
    pub fn recv_reply(&mut self) -> Option<Box<Message<T>>> {
        let reply = self.from_worker.pop()?;

        self.processing_time = smooth(
            self.processing_time,
            reply.processing_time,
            self.config.ialpha,
        );
        self.cpu_time = reply.cpu_time;

        debug_assert!(self.endpoint.outstanding > 0);
        debug_assert!(reply.sequence > self.endpoint.ack);
        // Replies never outnumber requests.
        debug_assert!(reply.sequence <= self.endpoint.sequence);

        self.endpoint.outstanding -= 1;
        self.endpoint.note_recv(reply.sequence, reply.ack, reply.when);

        Some(reply)
    }

    /// Hands the channel to the worker thread.
    ///
    /// The worker completes the handshake with
    /// [`WorkerChannel::receive_open`](super::WorkerChannel::receive_open)
    /// when it services the resulting [`ChannelEvent::Open`].
    pub fn signal_open(&self) -> Result<()> {
        log::debug!("channel {}: open signalled", self.shared.id.raw());
        self.control.send(ControlRecord {
            signal: ControlSignal::Open,
            ack: 0,
            channel: self.shared.id,
        })
    }

    /// Announces that this side is closing the channel.
    ///
    /// The channel stays allocated until the worker mirrors the close;
    /// sends after this call are a caller error.
    pub fn signal_close(&mut self) -> Result<()> {
        self.shared.active.store(false, Ordering::Release);
        self.state = if self.peer_closed {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
        log::debug!("channel {}: master closing", self.shared.id.raw());

        self.control.send(ControlRecord {
            signal: ControlSignal::Close,
            ack: CLOSE_FROM_MASTER,
            channel: self.shared.id,
        })
    }

    /// Services one control record addressed to the master thread.
    ///
    /// Drain notifications and sleep announcements carry the worker's ack;
    /// when it trails our sequence the worker went quiet with work still
    /// queued, so it is signalled again.
    pub fn service_control(&mut self, record: &ControlRecord, now: Instant) -> ChannelEvent {
        if record.channel != self.shared.id {
            log::debug!(
                "channel {}: record for channel {} misrouted to master",
                self.shared.id.raw(),
                record.channel.raw()
            );
            return ChannelEvent::Error;
        }

        match record.signal {
            ControlSignal::Error => ChannelEvent::Error,
            ControlSignal::DataFromWorker => ChannelEvent::DataReadyMaster,
            ControlSignal::Close => {
                self.peer_closed = true;
                if self.state == ChannelState::Closing {
                    self.state = ChannelState::Closed;
                }
                ChannelEvent::Close
            }
            ControlSignal::DataDoneWorker => match self.resignal_if_behind(record.ack, now) {
                Ok(()) => ChannelEvent::DataReadyMaster,
                Err(_) => ChannelEvent::Error,
            },
            ControlSignal::WorkerSleeping => match self.resignal_if_behind(record.ack, now) {
                Ok(()) => ChannelEvent::Noop,
                Err(_) => ChannelEvent::Error,
            },
            // The worker-directed signals make no sense here.
            _ => ChannelEvent::Error,
        }
    }

    /// Acknowledges a wakeup of the master thread and counts it.
    ///
    /// Returns the number of control records pending; `0` means the wakeup
    /// was spurious.
    pub fn service_wakeup(&mut self, control: &mut ControlReceiver) -> usize {
        let pending = control.acknowledge();
        if pending > 0 {
            self.endpoint.stats.num_wakeups += 1;
        }
        pending
    }

    /// Wakes the worker again if its reported ack trails our sequence.
    fn resignal_if_behind(&mut self, ack: u64, now: Instant) -> Result<()> {
        if ack == self.endpoint.sequence {
            return Ok(());
        }
        debug_assert!(ack < self.endpoint.sequence);

        self.endpoint.stats.num_resignals += 1;
        log::trace!(
            "channel {}: worker acked {} of {}, re-signalling",
            self.shared.id.raw(),
            ack,
            self.endpoint.sequence
        );
        self.data_ready(now, ControlSignal::DataToWorker)
    }

    fn data_ready(&mut self, when: Instant, signal: ControlSignal) -> Result<()> {
        self.endpoint.note_signal(when);
        log::trace!(
            "channel {}: signalling {:?} ack={}",
            self.shared.id.raw(),
            signal,
            self.endpoint.ack
        );
        self.control.send(ControlRecord {
            signal,
            ack: self.endpoint.ack,
            channel: self.shared.id,
        })
    }

    /// Returns the count of requests sent.
    pub fn sequence(&self) -> u64 {
        self.endpoint.sequence
    }

    /// Returns the highest reply sequence received.
    pub fn ack(&self) -> u64 {
        self.endpoint.ack
    }

    /// Returns the number of requests without a reply yet.
    pub fn outstanding(&self) -> u64 {
        self.endpoint.outstanding
    }

    /// Returns the smoothed interval between request sends.
    pub fn message_interval(&self) -> Duration {
        self.endpoint.message_interval
    }

    /// Returns the smoothed worker processing time for this channel.
    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    /// Returns the worker CPU time as of the latest reply.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// Returns the instrumentation counters for this side.
    pub fn stats(&self) -> &EndpointStats {
        &self.endpoint.stats
    }
}
