use std::sync::Arc;
use std::thread;
use std::time::Instant as WallClock;

use crossbeam_utils::sync::Parker;
use log::info;
use xchannel::{
    channel, control_plane, ChannelEvent, ChannelId, Clock, Config, Duration, Message, SendError,
    ThreadWaker, CONTROL_QUEUE_SIZE,
};

const MESSAGES: u64 = 1_000_000;
const MAX_IN_FLIGHT: u64 = 512;

fn main() {
    env_logger::init();

    let clock = Clock::new();
    let master_parker = Parker::new();
    let worker_parker = Parker::new();

    let (master_ctl, mut master_rx) = control_plane(
        CONTROL_QUEUE_SIZE,
        Arc::new(ThreadWaker::new(master_parker.unparker().clone())),
    );
    let (worker_ctl, mut worker_rx) = control_plane(
        CONTROL_QUEUE_SIZE,
        Arc::new(ThreadWaker::new(worker_parker.unparker().clone())),
    );

    let (mut master, mut worker) = channel::create::<u64>(
        ChannelId::new(1),
        Config::default(),
        master_ctl,
        worker_ctl,
        clock.now(),
    );
    master.signal_open().expect("open signal");

    info!("exchanging {} messages across two threads...", MESSAGES);
    let started = WallClock::now();

    let worker_clock = clock.clone();
    let worker_thread = thread::spawn(move || {
        let mut replied = 0u64;
        let mut pending: Option<Box<Message<u64>>> = None;
        let mut deferred: Option<Box<Message<u64>>> = None;
        let mut closing = false;

        while !closing {
            worker.service_wakeup(&mut worker_rx);
            while let Some(rec) = worker_rx.pop() {
                match worker.service_control(&rec) {
                    ChannelEvent::Open => worker.receive_open().expect("open handshake"),
                    ChannelEvent::Close => {
                        worker.ack_close().expect("close ack");
                        closing = true;
                    }
                    _ => {}
                }
            }

            // Retry a reply the lane rejected earlier.
            if let Some(reply) = deferred.take() {
                match worker.send_reply(reply) {
                    Ok(drained) => {
                        replied += 1;
                        if pending.is_none() {
                            pending = drained;
                        }
                    }
                    Err(SendError::Full { message, drained }) => {
                        deferred = Some(message);
                        if pending.is_none() {
                            pending = drained;
                        }
                    }
                    Err(err) => panic!("reply failed: {}", err),
                }
            }

            let mut request = if deferred.is_none() {
                pending.take().or_else(|| worker.recv_request())
            } else {
                None
            };
            while let Some(req) = request {
                let now = worker_clock.now();
                let reply = Box::new(Message::new(req.payload, now).with_telemetry(
                    now.saturating_duration_since(req.when),
                    Duration::ZERO,
                ));
                match worker.send_reply(reply) {
                    Ok(drained) => {
                        replied += 1;
                        request = drained.or_else(|| worker.recv_request());
                    }
                    Err(SendError::Full { message, drained }) => {
                        // Reply lane full: hold the reply and let the
                        // master drain.
                        deferred = Some(message);
                        pending = drained;
                        request = None;
                    }
                    Err(err) => panic!("reply failed: {}", err),
                }
            }

            if !closing {
                worker.worker_sleeping().expect("sleep notification");
                worker_parker.park_timeout(std::time::Duration::from_micros(200));
            }
        }

        (replied, *worker.stats())
    });

    let mut sent = 0u64;
    let mut received = 0u64;
    while received < MESSAGES {
        master.service_wakeup(&mut master_rx);
        while let Some(rec) = master_rx.pop() {
            master.service_control(&rec, clock.now());
        }
        while master.recv_reply().is_some() {
            received += 1;
        }

        if sent < MESSAGES && master.outstanding() < MAX_IN_FLIGHT {
            let message = Box::new(Message::new(sent, clock.now()));
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
                    master_parker.park_timeout(std::time::Duration::from_micros(50));
                }
                Err(err) => panic!("send failed: {}", err),
            }
        } else {
            master_parker.park_timeout(std::time::Duration::from_micros(50));
        }
    }

    let elapsed = started.elapsed();

    master.signal_close().expect("close signal");
    let (replied, worker_stats) = worker_thread.join().expect("worker thread");

    // Consume the worker's close acknowledgement.
    while let Some(rec) = master_rx.pop() {
        master.service_control(&rec, clock.now());
    }

    let rate = MESSAGES as f64 / elapsed.as_secs_f64();
    info!("=== Exchange Complete ===");
    info!("messages: {} sent, {} replies", sent, replied);
    info!("time: {:.3} seconds", elapsed.as_secs_f64());
    info!("rate: {:.0} msgs/sec round-trip", rate);
    info!(
        "master: {} signals, {} re-signals, {} wakeups, interval {}ns",
        master.stats().num_signals,
        master.stats().num_resignals,
        master.stats().num_wakeups,
        master.message_interval().as_nanos()
    );
    info!(
        "worker: {} signals ({:.1}% re-signals), {} wakeups",
        worker_stats.num_signals,
        worker_stats.resignal_rate(),
        worker_stats.num_wakeups
    );
    info!(
        "processing time: {}ns smoothed",
        master.processing_time().as_nanos()
    );
}
