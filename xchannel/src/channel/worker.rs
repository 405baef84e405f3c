//! Worker side of a channel.
//!
//! The worker receives requests, sends replies carrying its timing
//! telemetry, and announces when it goes idle so the master can catch a
//! missed wakeup.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::Ordering;

use crate::config::Config;
use crate::control::{ControlReceiver, ControlRecord, ControlSender, ControlSignal};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::queue::{Consumer, Producer};
use crate::time::{Duration, Instant};

use super::{
    ChannelEvent, ChannelId, ChannelState, Endpoint, EndpointStats, SendError, SendResult, Shared,
    CLOSE_FROM_WORKER,
};

/// The worker-side handle of a channel.
///
/// Created dormant: until the open handshake is serviced
/// ([`receive_open`](Self::receive_open)), operations that would signal the
/// master fail with [`Error::NotOpen`].
pub struct WorkerChannel<T> {
    shared: Arc<Shared>,
    config: Config,
    endpoint: Endpoint,
    state: ChannelState,
    peer_closed: bool,

    /// Whether the open handshake completed.
    opened: bool,

    /// Control sender targeting the master thread's lane.
    control: ControlSender,

    /// Outbound reply lane.
    from_worker: Producer<Box<Message<T>>>,

    /// Inbound request lane.
    to_worker: Consumer<Box<Message<T>>>,

    /// Opaque per-worker context.
    ctx: Option<Box<dyn Any + Send>>,
}

impl<T> WorkerChannel<T> {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: Config,
        control: ControlSender,
        from_worker: Producer<Box<Message<T>>>,
        to_worker: Consumer<Box<Message<T>>>,
        now: Instant,
    ) -> Self {
        Self {
            shared,
            config,
            endpoint: Endpoint::new(now),
            state: ChannelState::Open,
            peer_closed: false,
            opened: false,
            control,
            from_worker,
            to_worker,
            ctx: None,
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

    /// Completes the open handshake on the worker side.
    ///
    /// Called when servicing [`ChannelEvent::Open`]. Fails with
    /// [`Error::AlreadyOpen`] on a second call.
    pub fn receive_open(&mut self) -> Result<()> {
        if self.opened {
            return Err(Error::AlreadyOpen);
        }
        self.opened = true;
        log::debug!("channel {}: worker side open", self.shared.id.raw());
        Ok(())
    }

    /// Receives one request from the master, if any. Never blocks.
    pub fn recv_request(&mut self) -> Option<Box<Message<T>>> {
        let request = self.to_worker.pop()?;

        debug_assert!(request.sequence > self.endpoint.ack);
        // Requests always run ahead of our replies.
        debug_assert!(request.sequence >= self.endpoint.sequence);

        self.endpoint.outstanding += 1;
        self.endpoint.note_recv(request.sequence, request.ack, request.when);

        Some(request)
    }

    /// Sends a reply to the master.
    ///
    /// Assigns `sequence` and `ack`, resolves one outstanding request, and
    /// opportunistically drains the next inbound request so the caller
    /// keeps a local work item. Whatever the outcome, the caller must
    /// service the drained request carried in the result, if any.
    ///
    /// The master is always woken when this reply empties the pipeline; a
    /// busy master is otherwise left alone.
    pub fn send_reply(&mut self, mut message: Box<Message<T>>) -> SendResult<T> {
        let when = message.when;
        let sequence = self.endpoint.sequence + 1;
        message.sequence = sequence;
        message.ack = self.endpoint.ack;

        if let Err(message) = self.from_worker.push(message) {
            log::debug!(
                "channel {}: reply lane full at sequence {}",
                self.shared.id.raw(),
                sequence
            );
            let drained = self.recv_request();
            return Err(SendError::Full { message, drained });
        }

        debug_assert!(self.endpoint.outstanding > 0);
        self.endpoint.outstanding -= 1;
        self.endpoint.note_send(when, sequence, self.config.ialpha);

        // The master may have pushed more work while we replied; check
        // before deciding the pipeline is dry.
        let drained = self.recv_request();

        let signalled = if self.endpoint.outstanding == 0 {
            // Pipeline drained; the master must learn even if it is busy.
            self.data_ready(when, ControlSignal::DataDoneWorker)
        } else if self.endpoint.should_signal(when, &self.config) {
            self.data_ready(when, ControlSignal::DataFromWorker)
        } else {
            Ok(())
        };

        match signalled {
            Ok(()) => Ok(drained),
            Err(error) => Err(SendError::Signal { error, drained }),
        }
    }

    /// Announces from the idle loop that this worker is going to sleep.
    ///
    /// Silent when nothing is outstanding, since the master already knows. The
    /// record carries our ack so the master can re-signal if it pushed
    /// work we have not seen.
    pub fn worker_sleeping(&mut self) -> Result<()> {
        if self.endpoint.outstanding == 0 {
            return Ok(());
        }
        if !self.opened {
            return Err(Error::NotOpen);
        }

        self.endpoint.stats.num_signals += 1;
        self.control.send(ControlRecord {
            signal: ControlSignal::WorkerSleeping,
            ack: self.endpoint.ack,
            channel: self.shared.id,
        })
    }

    /// Mirrors a close announced by the master, or initiates one.
    pub fn ack_close(&mut self) -> Result<()> {
        if !self.opened {
            return Err(Error::NotOpen);
        }

        self.shared.active.store(false, Ordering::Release);
        self.state = if self.peer_closed {
            ChannelState::Closed
        } else {
            ChannelState::Closing
        };
        log::debug!("channel {}: worker closing", self.shared.id.raw());

        self.control.send(ControlRecord {
            signal: ControlSignal::Close,
            ack: CLOSE_FROM_WORKER,
            channel: self.shared.id,
        })
    }

    /// Services one control record addressed to the worker thread.
    pub fn service_control(&mut self, record: &ControlRecord) -> ChannelEvent {
        if record.channel != self.shared.id {
            log::debug!(
                "channel {}: record for channel {} misrouted to worker",
                self.shared.id.raw(),
                record.channel.raw()
            );
            return ChannelEvent::Error;
        }

        match record.signal {
            ControlSignal::Error => ChannelEvent::Error,
            ControlSignal::DataToWorker => ChannelEvent::DataReadyWorker,
            ControlSignal::Open => ChannelEvent::Open,
            ControlSignal::Close => {
                self.peer_closed = true;
                if self.state == ChannelState::Closing {
                    self.state = ChannelState::Closed;
                }
                ChannelEvent::Close
            }
            // The master-directed signals make no sense here.
            _ => ChannelEvent::Error,
        }
    }

    /// Acknowledges a wakeup of the worker thread and counts it.
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

    fn data_ready(&mut self, when: Instant, signal: ControlSignal) -> Result<()> {
        if !self.opened {
            return Err(Error::NotOpen);
        }

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

    /// Attaches per-worker context to the channel.
    pub fn set_ctx(&mut self, ctx: Box<dyn Any + Send>) {
        self.ctx = Some(ctx);
    }

    /// Returns the attached per-worker context, if any.
    pub fn ctx(&self) -> Option<&(dyn Any + Send)> {
        self.ctx.as_deref()
    }

    /// Removes and returns the attached per-worker context.
    pub fn take_ctx(&mut self) -> Option<Box<dyn Any + Send>> {
        self.ctx.take()
    }

    /// Returns the count of replies sent.
    pub fn sequence(&self) -> u64 {
        self.endpoint.sequence
    }

    /// Returns the highest request sequence received.
    pub fn ack(&self) -> u64 {
        self.endpoint.ack
    }

    /// Returns the number of requests received but not replied to.
    pub fn outstanding(&self) -> u64 {
        self.endpoint.outstanding
    }

    /// Returns the smoothed interval between reply sends.
    pub fn message_interval(&self) -> Duration {
        self.endpoint.message_interval
    }

    /// Returns the instrumentation counters for this side.
    pub fn stats(&self) -> &EndpointStats {
        &self.endpoint.stats
    }
}
