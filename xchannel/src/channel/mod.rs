//! Request/reply channel coupling a master thread with a worker thread.
//!
//! A channel is two one-way bulk lanes plus the threads' control lanes:
//!
//! ```text
//! master ──send_request──►  to_worker lane    ──recv_request──► worker
//! master ◄──recv_reply───  from_worker lane  ◄───send_reply─── worker
//!         ◄─── wakeup signals via control lanes ───►
//! ```
//!
//! [`create`] returns one handle per side. Each handle owns its endpoint
//! state outright: sequence, ack and timing fields are never read across
//! threads; the peers learn about each other's progress from the framing
//! fields on messages and the ack carried in control records.

mod master;
mod worker;

pub use master::MasterChannel;
pub use worker::WorkerChannel;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::AtomicBool;

use crate::config::Config;
use crate::control::ControlSender;
use crate::error::Error;
use crate::message::Message;
use crate::queue::atomic_queue;
use crate::time::{smooth, Duration, Instant};

/// Identifies a channel in the host's channel table.
///
/// Control records carry this id instead of a channel reference; the host
/// scheduler resolves it to the right handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Creates a channel id from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Channel lifecycle state (one side's view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is open and operational.
    Open,

    /// This side announced the close; the peer has not mirrored it yet.
    Closing,

    /// Both sides announced the close.
    Closed,
}

/// Event produced by servicing a control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The control lane had no record.
    Empty,

    /// An error record, or a record this side cannot interpret.
    Error,

    /// Requests are queued for the worker.
    DataReadyWorker,

    /// Replies are queued for the master.
    DataReadyMaster,

    /// A channel is being handed to this worker thread.
    Open,

    /// The peer is closing the channel.
    Close,

    /// Record consumed, nothing to act on.
    Noop,
}

/// Role tags carried in the ack field of CLOSE records.
pub(crate) const CLOSE_FROM_MASTER: u64 = 0;
pub(crate) const CLOSE_FROM_WORKER: u64 = 1;

/// Result of a bulk-lane send.
///
/// `Ok` carries a message opportunistically drained from the inbound lane,
/// so a busy caller keeps making forward progress without extra polling.
pub type SendResult<T> = core::result::Result<Option<Box<Message<T>>>, SendError<T>>;

/// Error from a bulk-lane send. No message handle is ever lost: failed
/// sends return the unsent message, and any message drained before the
/// failure rides along.
#[derive(Debug)]
pub enum SendError<T> {
    /// The outbound lane is full. The caller should service the drained
    /// message (if any) and try another channel or retry later.
    Full {
        /// The message that was not queued.
        message: Box<Message<T>>,
        /// A message drained from the inbound lane, if one was waiting.
        drained: Option<Box<Message<T>>>,
    },

    /// The message was queued but signalling the peer failed. The peer
    /// will still find the message on its next service pass.
    Signal {
        /// The control-lane error, propagated verbatim.
        error: Error,
        /// A message drained from the inbound lane, if one was waiting.
        drained: Option<Box<Message<T>>>,
    },
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full { .. } => f.write_str("bulk lane full"),
            SendError::Signal { error, .. } => write!(f, "peer signal failed: {}", error),
        }
    }
}

#[cfg(feature = "std")]
impl<T: fmt::Debug> std::error::Error for SendError<T> {}

/// Instrumentation counters for one endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndpointStats {
    /// Control-lane signals sent to the peer.
    pub num_signals: u64,

    /// Signals re-sent because the peer's ack lagged at drain or sleep
    /// time.
    pub num_resignals: u64,

    /// Wakeup service passes that found pending control records.
    pub num_wakeups: u64,
}

impl EndpointStats {
    /// Creates zeroed counters.
    pub const fn new() -> Self {
        Self {
            num_signals: 0,
            num_resignals: 0,
            num_wakeups: 0,
        }
    }

    /// Returns the share of signals that were re-signals, as a percentage.
    pub fn resignal_rate(&self) -> f32 {
        if self.num_signals == 0 {
            0.0
        } else {
            (self.num_resignals as f32 / self.num_signals as f32) * 100.0
        }
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// State shared between the two handles. Everything else is owned by
/// exactly one side.
pub(crate) struct Shared {
    pub(crate) id: ChannelId,
    pub(crate) active: AtomicBool,
}

/// Thread-local state of one channel endpoint.
#[derive(Debug)]
pub(crate) struct Endpoint {
    /// Messages sent on the outbound lane.
    pub(crate) sequence: u64,

    /// Highest peer sequence observed on received messages.
    pub(crate) ack: u64,

    /// Highest ack framing field observed on received messages, i.e. the
    /// peer's progress through our sequence space as last reported.
    pub(crate) peer_ack: u64,

    /// Sent-but-unanswered (master) or received-but-unreplied (worker).
    pub(crate) outstanding: u64,

    /// Our sequence when we last signalled the peer.
    pub(crate) sequence_at_last_signal: u64,

    /// Last successful outbound push.
    pub(crate) last_write: Instant,

    /// Last successful receive from the peer.
    pub(crate) last_read_other: Instant,

    /// Last data-ready signal we sent.
    pub(crate) last_sent_signal: Instant,

    /// Smoothed inter-message interval on the outbound lane.
    pub(crate) message_interval: Duration,

    pub(crate) stats: EndpointStats,
}

impl Endpoint {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            sequence: 0,
            ack: 0,
            peer_ack: 0,
            outstanding: 0,
            sequence_at_last_signal: 0,
            last_write: now,
            last_read_other: now,
            last_sent_signal: now,
            message_interval: Duration::ZERO,
            stats: EndpointStats::new(),
        }
    }

    /// Records a successful outbound push.
    pub(crate) fn note_send(&mut self, when: Instant, sequence: u64, ialpha: u64) {
        debug_assert!(self.last_write <= when);

        self.sequence = sequence;
        self.message_interval = smooth(
            self.message_interval,
            when.saturating_duration_since(self.last_write),
            ialpha,
        );
        self.last_write = when;
    }

    /// Records the framing of a received message.
    pub(crate) fn note_recv(&mut self, sequence: u64, ack: u64, when: Instant) {
        // The lanes are FIFO, so sequences arrive gapless.
        debug_assert_eq!(sequence, self.ack + 1);
        debug_assert!(self.last_read_other <= when);

        self.ack = sequence;
        if ack > self.peer_ack {
            self.peer_ack = ack;
        }
        self.last_read_other = when;
    }

    /// Records an outgoing data-ready signal.
    pub(crate) fn note_signal(&mut self, when: Instant) {
        self.last_sent_signal = when;
        self.sequence_at_last_signal = self.sequence;
        self.stats.num_signals += 1;
    }

    /// Decides whether a data-ready signal is needed after a send at `now`.
    ///
    /// Callers handle the mandatory cases (first in-flight message,
    /// pipeline drained) before asking. A signal is required when the peer
    /// has fallen too far behind on acks; it is skipped while the peer is
    /// demonstrably active (we heard from it recently, or we poked it
    /// recently and the wakeup coalesces with ours).
    pub(crate) fn should_signal(&self, now: Instant, config: &Config) -> bool {
        if config.assume_signal_coalescing && self.sequence_at_last_signal > self.peer_ack {
            // An earlier signal is still pending delivery and covers this
            // send too.
            return false;
        }

        debug_assert!(self.peer_ack <= self.sequence);
        if self.sequence - self.peer_ack > config.ack_lag_threshold {
            return true;
        }

        let heard_recently =
            now.saturating_duration_since(self.last_read_other) < config.signal_interval;
        let signalled_recently =
            now.saturating_duration_since(self.last_sent_signal) < config.signal_interval;

        !(heard_recently || signalled_recently)
    }
}

/// Creates a channel between a master thread and a worker thread.
///
/// `master_control` must target the master thread's control lane and
/// `worker_control` the worker thread's; the handles route their signals
/// accordingly. The master handle is ready immediately. The worker handle
/// must observe the open handshake ([`MasterChannel::signal_open`] /
/// [`WorkerChannel::receive_open`]) before it can signal.
pub fn create<T>(
    id: ChannelId,
    config: Config,
    master_control: ControlSender,
    worker_control: ControlSender,
    now: Instant,
) -> (MasterChannel<T>, WorkerChannel<T>) {
    let (to_worker_tx, to_worker_rx) = atomic_queue(config.queue_size);
    let (from_worker_tx, from_worker_rx) = atomic_queue(config.queue_size);

    let shared = Arc::new(Shared {
        id,
        active: AtomicBool::new(true),
    });

    let master = MasterChannel::new(
        Arc::clone(&shared),
        config,
        worker_control,
        to_worker_tx,
        from_worker_rx,
        now,
    );
    let worker = WorkerChannel::new(shared, config, master_control, from_worker_tx, to_worker_rx, now);

    (master, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{control_plane, ControlReceiver, ControlSignal};
    use crate::waker::NoopWaker;
    use crate::CONTROL_QUEUE_SIZE;

    struct Harness {
        master: MasterChannel<u32>,
        worker: WorkerChannel<u32>,
        master_rx: ControlReceiver,
        worker_rx: ControlReceiver,
    }

    fn harness(config: Config) -> Harness {
        let (master_tx, master_rx) = control_plane(CONTROL_QUEUE_SIZE, Arc::new(NoopWaker::new()));
        let (worker_tx, worker_rx) = control_plane(CONTROL_QUEUE_SIZE, Arc::new(NoopWaker::new()));
        let (master, worker) = create(
            ChannelId::new(1),
            config,
            master_tx,
            worker_tx,
            Instant::ZERO,
        );
        Harness {
            master,
            worker,
            master_rx,
            worker_rx,
        }
    }

    fn open(h: &mut Harness) {
        h.master.signal_open().unwrap();
        let rec = h.worker_rx.pop().unwrap();
        assert_eq!(rec.signal, ControlSignal::Open);
        assert_eq!(h.worker.service_control(&rec), ChannelEvent::Open);
        h.worker.receive_open().unwrap();
    }

    fn msg(when: u64) -> Box<Message<u32>> {
        Box::new(Message::new(0, Instant::from_nanos(when)))
    }

    fn reply(when: u64, processing: u64, cpu: u64) -> Box<Message<u32>> {
        Box::new(
            Message::new(0, Instant::from_nanos(when)).with_telemetry(
                Duration::from_nanos(processing),
                Duration::from_nanos(cpu),
            ),
        )
    }

    // Five strict ping-pong exchanges: every send finds the pipeline
    // drained, so every send signals, and the reply telemetry smooths in.
    #[test]
    fn test_ping_pong_five() {
        let mut h = harness(Config::default());
        open(&mut h);

        for i in 1..=5u64 {
            let when = i * 100;
            assert!(h.master.send_request(msg(when)).unwrap().is_none());

            let rec = h.worker_rx.pop().unwrap();
            assert_eq!(rec.signal, ControlSignal::DataToWorker);
            assert_eq!(h.worker.service_control(&rec), ChannelEvent::DataReadyWorker);

            let req = h.worker.recv_request().unwrap();
            assert_eq!(req.sequence, i);

            assert!(h.worker.send_reply(reply(when + 50, 50, i * 10)).unwrap().is_none());

            let rec = h.master_rx.pop().unwrap();
            assert_eq!(rec.signal, ControlSignal::DataDoneWorker);
            assert_eq!(
                h.master
                    .service_control(&rec, Instant::from_nanos(when + 60)),
                ChannelEvent::DataReadyMaster
            );

            let rep = h.master.recv_reply().unwrap();
            assert_eq!(rep.sequence, i);
        }

        assert_eq!(h.master.sequence(), 5);
        assert_eq!(h.master.ack(), 5);
        assert_eq!(h.master.outstanding(), 0);
        assert_eq!(h.master.stats().num_signals, 5);
        assert_eq!(h.master.stats().num_resignals, 0);
        // Fixed-point smoothing of a constant 50ns sample settles at 49.
        assert_eq!(h.master.processing_time(), Duration::from_nanos(49));
        assert_eq!(h.master.cpu_time(), Duration::from_nanos(50));
        assert_eq!(h.worker.stats().num_signals, 5);
        assert!(h.worker_rx.is_empty());
    }

    // A burst with no replies: the first send signals, the next 999 are
    // elided (the peer was heard from recently), and every send past the
    // ack lag threshold signals again.
    #[test]
    fn test_burst_without_replies_crosses_lag_threshold() {
        let mut h = harness(Config::new().with_queue_size(2048));
        open(&mut h);

        for i in 1..=1500u64 {
            assert!(h.master.send_request(msg(i)).unwrap().is_none());
        }

        assert_eq!(h.master.sequence(), 1500);
        assert_eq!(h.master.outstanding(), 1500);
        assert_eq!(h.master.stats().num_signals, 1 + 500);
        assert_eq!(h.worker_rx.len(), 501);
    }

    // Same burst against a default-size lane: the 1025th send overflows
    // and the caller gets the message back.
    #[test]
    fn test_burst_overloads_default_queue() {
        let mut h = harness(Config::default());
        open(&mut h);

        for i in 1..=1024u64 {
            assert!(h.master.send_request(msg(i)).unwrap().is_none());
        }

        for i in 1025..=1100u64 {
            match h.master.send_request(msg(i)) {
                Err(SendError::Full { message, drained }) => {
                    assert_eq!(message.when, Instant::from_nanos(i));
                    assert!(drained.is_none());
                }
                other => panic!("expected overload, got {:?}", other.map(|_| ())),
            }
        }

        assert_eq!(h.master.sequence(), 1024);
        assert_eq!(h.master.outstanding(), 1024);
    }

    // A sleeping worker with unseen requests makes the master re-signal.
    #[test]
    fn test_worker_sleeping_triggers_resignal() {
        let mut h = harness(Config::default());
        open(&mut h);

        for i in 1..=6u64 {
            h.master.send_request(msg(i * 100)).unwrap();
        }
        let rec = h.worker_rx.pop().unwrap();
        h.worker.service_control(&rec);
        assert!(h.worker_rx.is_empty());

        for _ in 0..3 {
            h.worker.recv_request().unwrap();
        }

        h.worker.worker_sleeping().unwrap();
        let rec = h.master_rx.pop().unwrap();
        assert_eq!(rec.signal, ControlSignal::WorkerSleeping);
        assert_eq!(rec.ack, 3);

        assert_eq!(
            h.master.service_control(&rec, Instant::from_nanos(700)),
            ChannelEvent::Noop
        );
        assert_eq!(h.master.stats().num_resignals, 1);

        let rec = h.worker_rx.pop().unwrap();
        assert_eq!(rec.signal, ControlSignal::DataToWorker);
    }

    // A worker with nothing outstanding does not announce that it sleeps.
    #[test]
    fn test_worker_sleeping_idle_is_silent() {
        let mut h = harness(Config::default());
        open(&mut h);

        h.worker.worker_sleeping().unwrap();
        assert!(h.master_rx.is_empty());
        assert_eq!(h.worker.stats().num_signals, 0);
    }

    // Overload against a working peer: the lane refills as the worker
    // drains, failed sends hand the message back, and replies keep
    // arriving piggyback, so the caller never stalls.
    #[test]
    fn test_overload_keeps_forward_progress() {
        let mut h = harness(Config::new().with_queue_size(2));
        open(&mut h);

        h.master.send_request(msg(10)).unwrap();
        h.master.send_request(msg(20)).unwrap();

        h.worker.recv_request().unwrap();
        // The reply resolves request 1 and pulls request 2 locally,
        // freeing the lane.
        let pulled = h.worker.send_reply(reply(30, 50, 50)).unwrap();
        assert_eq!(pulled.unwrap().sequence, 2);

        // Refill: the first send rides the freed slot and picks up the
        // reply, the second fills the lane, the third overflows.
        assert_eq!(h.master.send_request(msg(40)).unwrap().unwrap().sequence, 1);
        assert!(h.master.send_request(msg(50)).unwrap().is_none());

        match h.master.send_request(msg(60)) {
            Err(SendError::Full { message, drained }) => {
                assert_eq!(message.when, Instant::from_nanos(60));
                assert_eq!(message.sequence, 5);
                assert!(drained.is_none());
            }
            other => panic!("expected overload, got {:?}", other.map(|_| ())),
        }

        assert_eq!(h.master.ack(), 1);
        assert_eq!(h.master.sequence(), 4);
        assert_eq!(h.master.outstanding(), 3);
    }

    // Orderly two-sided close.
    #[test]
    fn test_close_handshake() {
        let mut h = harness(Config::default());
        open(&mut h);

        h.master.signal_close().unwrap();
        assert!(!h.master.is_active());
        assert_eq!(h.master.state(), ChannelState::Closing);

        let rec = h.worker_rx.pop().unwrap();
        assert_eq!(rec.signal, ControlSignal::Close);
        assert_eq!(rec.ack, CLOSE_FROM_MASTER);
        assert_eq!(h.worker.service_control(&rec), ChannelEvent::Close);
        assert!(!h.worker.is_active());

        h.worker.ack_close().unwrap();
        assert_eq!(h.worker.state(), ChannelState::Closed);

        let rec = h.master_rx.pop().unwrap();
        assert_eq!(rec.signal, ControlSignal::Close);
        assert_eq!(rec.ack, CLOSE_FROM_WORKER);
        assert_eq!(
            h.master.service_control(&rec, Instant::from_nanos(100)),
            ChannelEvent::Close
        );
        assert_eq!(h.master.state(), ChannelState::Closed);

        assert!(h.master_rx.is_empty());
        assert!(h.worker_rx.is_empty());
    }

    // Worker-initiated close mirrors the handshake.
    #[test]
    fn test_close_initiated_by_worker() {
        let mut h = harness(Config::default());
        open(&mut h);

        h.worker.ack_close().unwrap();
        assert_eq!(h.worker.state(), ChannelState::Closing);
        assert!(!h.master.is_active());

        let rec = h.master_rx.pop().unwrap();
        assert_eq!(
            h.master.service_control(&rec, Instant::from_nanos(10)),
            ChannelEvent::Close
        );

        h.master.signal_close().unwrap();
        assert_eq!(h.master.state(), ChannelState::Closed);

        let rec = h.worker_rx.pop().unwrap();
        assert_eq!(h.worker.service_control(&rec), ChannelEvent::Close);
        assert_eq!(h.worker.state(), ChannelState::Closed);
    }

    // Steady pipelined traffic: the master keeps one message in flight
    // while draining replies piggyback, so after the first signal every
    // further one is elided.
    #[test]
    fn test_elision_in_steady_state() {
        const COUNT: u64 = 10_000;

        let mut h = harness(Config::default());
        open(&mut h);

        for i in 1..=COUNT {
            let when = i * 100;
            let drained = h.master.send_request(msg(when)).unwrap();
            assert_eq!(drained.is_some(), i > 1);

            while let Some(rec) = h.worker_rx.pop() {
                h.worker.service_control(&rec);
            }

            let req = h.worker.recv_request().unwrap();
            assert_eq!(req.sequence, i);
            assert!(h.worker.send_reply(reply(when + 50, 50, 50)).unwrap().is_none());

            let rec = h.master_rx.pop().unwrap();
            assert_eq!(rec.signal, ControlSignal::DataDoneWorker);
            assert_eq!(
                h.master
                    .service_control(&rec, Instant::from_nanos(when + 60)),
                ChannelEvent::DataReadyMaster
            );
        }

        assert!(h.master.recv_reply().is_some());
        assert!(h.master.recv_reply().is_none());

        assert_eq!(h.master.ack(), COUNT);
        assert_eq!(h.master.outstanding(), 0);
        // Only the very first send woke the worker; the rest coasted on
        // the reply stream.
        assert_eq!(h.master.stats().num_signals, 1);
        assert_eq!(h.master.stats().num_resignals, 0);
        assert_eq!(h.worker.stats().num_signals, COUNT);
    }

    // With the coalescing refinement on, a burst produces exactly one
    // signal: the un-acked first signal covers all later sends.
    #[test]
    fn test_burst_with_signal_coalescing() {
        let mut h = harness(
            Config::new()
                .with_queue_size(2048)
                .with_signal_coalescing(true),
        );
        open(&mut h);

        for i in 1..=1500u64 {
            assert!(h.master.send_request(msg(i)).unwrap().is_none());
        }

        assert_eq!(h.master.stats().num_signals, 1);
    }

    // A drain notification whose ack trails our sequence re-signals: the
    // worker went quiet just as the master pushed more work.
    #[test]
    fn test_data_done_triggers_resignal_when_behind() {
        let mut h = harness(Config::default());
        open(&mut h);

        for i in 1..=3u64 {
            h.master.send_request(msg(i * 100)).unwrap();
        }
        while h.worker_rx.pop().is_some() {}

        for _ in 0..3 {
            h.worker.recv_request().unwrap();
        }
        for i in 1..=3u64 {
            h.worker.send_reply(reply(500 + i * 10, 50, 50)).unwrap();
        }

        // Only the pipeline-drained reply signalled.
        let done = h.master_rx.pop().unwrap();
        assert_eq!(done.signal, ControlSignal::DataDoneWorker);
        assert_eq!(done.ack, 3);
        assert!(h.master_rx.is_empty());

        // More work lands before the master services the notification.
        h.master.send_request(msg(600)).unwrap();
        h.master.send_request(msg(700)).unwrap();

        assert_eq!(
            h.master.service_control(&done, Instant::from_nanos(800)),
            ChannelEvent::DataReadyMaster
        );
        assert_eq!(h.master.stats().num_resignals, 1);
        assert_eq!(
            h.worker_rx.pop().unwrap().signal,
            ControlSignal::DataToWorker
        );
    }

    // Records that make no sense for a side surface as error events.
    #[test]
    fn test_misrouted_records_are_errors() {
        let mut h = harness(Config::default());
        open(&mut h);

        let open_rec = crate::control::ControlRecord {
            signal: ControlSignal::Open,
            ack: 0,
            channel: ChannelId::new(1),
        };
        assert_eq!(
            h.master.service_control(&open_rec, Instant::ZERO),
            ChannelEvent::Error
        );

        let reply_rec = crate::control::ControlRecord {
            signal: ControlSignal::DataFromWorker,
            ack: 0,
            channel: ChannelId::new(1),
        };
        assert_eq!(h.worker.service_control(&reply_rec), ChannelEvent::Error);

        let wrong_channel = crate::control::ControlRecord {
            signal: ControlSignal::DataFromWorker,
            ack: 0,
            channel: ChannelId::new(99),
        };
        assert_eq!(
            h.master.service_control(&wrong_channel, Instant::ZERO),
            ChannelEvent::Error
        );
    }

    // Wakeup accounting: service passes with records pending are counted,
    // spurious ones are not.
    #[test]
    fn test_service_wakeup_counts_batches() {
        let mut h = harness(Config::default());
        open(&mut h);

        assert_eq!(h.master.service_wakeup(&mut h.master_rx), 0);
        assert_eq!(h.master.stats().num_wakeups, 0);

        h.master.send_request(msg(100)).unwrap();
        h.worker.service_control(&h.worker_rx.pop().unwrap());
        h.worker.recv_request().unwrap();
        h.worker.send_reply(reply(150, 50, 50)).unwrap();

        assert_eq!(h.master.service_wakeup(&mut h.master_rx), 1);
        assert_eq!(h.master.stats().num_wakeups, 1);
    }

    // Full two-thread run with parked event loops and real wakeups.
    #[cfg(feature = "std")]
    #[test]
    fn test_threaded_pipeline() {
        use crate::time::Clock;
        use crate::waker::ThreadWaker;
        use crossbeam_utils::sync::Parker;

        const COUNT: u64 = 20_000;
        const MAX_IN_FLIGHT: u64 = 512;

        let clock = Clock::new();
        let master_parker = Parker::new();
        let worker_parker = Parker::new();

        let (master_tx, mut master_rx) = control_plane(
            CONTROL_QUEUE_SIZE,
            Arc::new(ThreadWaker::new(master_parker.unparker().clone())),
        );
        let (worker_tx, mut worker_rx) = control_plane(
            CONTROL_QUEUE_SIZE,
            Arc::new(ThreadWaker::new(worker_parker.unparker().clone())),
        );

        let (mut master, mut worker) = create::<u32>(
            ChannelId::new(1),
            Config::default(),
            master_tx,
            worker_tx,
            clock.now(),
        );
        master.signal_open().unwrap();

        let worker_clock = clock.clone();
        let worker_thread = std::thread::spawn(move || {
            let mut replied = 0u64;
            let mut pending: Option<Box<Message<u32>>> = None;

            while replied < COUNT {
                worker_rx.acknowledge();
                while let Some(rec) = worker_rx.pop() {
                    if worker.service_control(&rec) == ChannelEvent::Open {
                        worker.receive_open().unwrap();
                    }
                }

                let mut request = pending.take().or_else(|| worker.recv_request());
                while let Some(req) = request {
                    let now = worker_clock.now();
                    let rep = Box::new(Message::new(req.payload, now).with_telemetry(
                        now.saturating_duration_since(req.when),
                        Duration::ZERO,
                    ));
                    match worker.send_reply(rep) {
                        Ok(drained) => {
                            replied += 1;
                            request = drained.or_else(|| worker.recv_request());
                        }
                        Err(err) => panic!("reply failed: {}", err),
                    }
                }

                if replied < COUNT {
                    worker.worker_sleeping().unwrap();
                    worker_parker.park_timeout(std::time::Duration::from_micros(200));
                }
            }
        });

        let mut sent = 0u64;
        let mut received = 0u64;
        while received < COUNT {
            master_rx.acknowledge();
            while let Some(rec) = master_rx.pop() {
                master.service_control(&rec, clock.now());
            }
            while master.recv_reply().is_some() {
                received += 1;
            }

            if sent < COUNT && master.outstanding() < MAX_IN_FLIGHT {
                let message = Box::new(Message::new(sent as u32, clock.now()));
                match master.send_request(message) {
                    Ok(drained) => {
                        sent += 1;
                        if drained.is_some() {
                            received += 1;
                        }
                    }
                    Err(SendError::Full { drained, .. }) => {
                        if drained.is_some() {
                            received += 1;
                        }
                        master_parker.park_timeout(std::time::Duration::from_micros(100));
                    }
                    Err(err) => panic!("send failed: {}", err),
                }
            } else {
                master_parker.park_timeout(std::time::Duration::from_micros(100));
            }
        }

        worker_thread.join().unwrap();

        assert_eq!(received, COUNT);
        assert_eq!(master.ack(), COUNT);
        assert_eq!(master.outstanding(), 0);
    }
}
