//! Rate-limited outbound line pipeline.
//!
//! All sessions push result lines into one bounded queue. A sender thread
//! pops them in order, pays for each with bucket credit, and writes it to the
//! sink; a refill thread tops the bucket up on a fixed tick. When the queue
//! overflows the oldest unsent lines are dropped.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::config::types::{Result, ThrottleConfig};
use crate::throttle::bucket::LeakyBucket;

struct QueueState {
    lines: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

/// Bounded FIFO that favours fresh lines over old ones.
pub struct OutboundQueue {
    bound: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl OutboundQueue {
    pub fn new(bound: usize) -> Self {
        Self {
            bound: bound.max(1),
            state: Mutex::new(QueueState {
                lines: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one line. Line breaks are flattened to spaces. Returns false once
    /// the queue is closed.
    pub fn push(&self, line: &str) -> bool {
        let line = line.replace(['\r', '\n'], " ");
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        while state.lines.len() >= self.bound {
            state.lines.pop_front();
            state.dropped += 1;
        }
        state.lines.push_back(line);
        self.ready.notify_one();
        true
    }

    /// Block for the next line; `None` once closed and empty.
    pub fn pop(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Some(line);
            }
            if state.closed {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

/// Cloneable producer end of a [`Throttle`].
#[derive(Clone)]
pub struct ThrottleHandle {
    queue: Arc<OutboundQueue>,
}

impl ThrottleHandle {
    pub fn send(&self, line: &str) -> bool {
        self.queue.push(line)
    }
}

/// Owns the refill and sender threads for one sink.
pub struct Throttle {
    queue: Arc<OutboundQueue>,
    bucket: Arc<LeakyBucket>,
    refill_shutdown: Option<Sender<()>>,
    refill_thread: Option<JoinHandle<()>>,
    sender_thread: Option<JoinHandle<()>>,
}

impl Throttle {
    pub fn start<W>(config: &ThrottleConfig, mut sink: W) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let bucket = Arc::new(LeakyBucket::new(config.capacity, config.start_credit)?);
        let queue = Arc::new(OutboundQueue::new(config.queue_bound));

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let tick = config.tick();
        let credit = config.credit_per_tick;
        let refill_bucket = Arc::clone(&bucket);
        let refill_thread = thread::Builder::new()
            .name("evalrelay-refill".to_string())
            .spawn(move || {
                debug!("Started throttle refill thread");
                loop {
                    match shutdown_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = refill_bucket.produce(credit) {
                                warn!("Throttle refill failed: {}", e);
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            })?;

        let extra = config.extra_per_line;
        let send_queue = Arc::clone(&queue);
        let send_bucket = Arc::clone(&bucket);
        let sender_thread = thread::Builder::new()
            .name("evalrelay-sender".to_string())
            .spawn(move || {
                while let Some(line) = send_queue.pop() {
                    let cost = extra + line.chars().count() as i64;
                    if let Err(e) = send_bucket.consume(cost) {
                        warn!("Throttle consume failed: {}", e);
                        continue;
                    }
                    let written = writeln!(sink, "{}", line).and_then(|_| sink.flush());
                    if let Err(e) = written {
                        warn!("Dropping outbound line, sink write failed: {}", e);
                    }
                }
            })?;

        info!(
            "Throttle started: capacity {}, {} credit every {:?}",
            config.capacity, config.credit_per_tick, tick
        );

        Ok(Self {
            queue,
            bucket,
            refill_shutdown: Some(shutdown_tx),
            refill_thread: Some(refill_thread),
            sender_thread: Some(sender_thread),
        })
    }

    pub fn handle(&self) -> ThrottleHandle {
        ThrottleHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn send(&self, line: &str) -> bool {
        self.queue.push(line)
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Flush everything queued so far and stop both threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.sender_thread.is_none() && self.refill_thread.is_none() {
            return;
        }
        self.queue.close();
        if let Some(sender) = self.sender_thread.take() {
            let _ = sender.join();
        }

        if let Some(shutdown) = self.refill_shutdown.take() {
            let _ = shutdown.send(());
        }
        // Unblocks a refill parked on a full bucket.
        self.bucket.drain();
        if let Some(refill) = self.refill_thread.take() {
            let _ = refill.join();
        }

        let dropped = self.queue.dropped();
        if dropped > 0 {
            warn!("Throttle dropped {} outbound lines under overload", dropped);
        }
        debug!("Throttle shutdown complete");
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.stop();
    }
}
