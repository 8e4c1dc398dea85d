//! Single-fire session abort.
//!
//! Any thread may request an abort; only the first request while the latch
//! is armed is recorded. The controlling flow observes it at its frame-wait
//! checkpoint. Disarming before teardown turns every later request into a
//! no-op.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::config::types::{AbortReason, Result};

type InterruptHook = Box<dyn FnOnce() + Send>;

struct LatchState {
    armed: bool,
    reason: Option<AbortReason>,
    interrupt: Option<InterruptHook>,
}

pub struct AbortLatch {
    state: Mutex<LatchState>,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
}

impl Default for AbortLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortLatch {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        Self {
            state: Mutex::new(LatchState {
                armed: true,
                reason: None,
                interrupt: None,
            }),
            notify_tx,
            notify_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `reason` unless an abort was already recorded or the latch is
    /// disarmed. Returns whether this call fired.
    pub fn request(&self, reason: AbortReason) -> bool {
        let mut state = self.lock();
        if !state.armed || state.reason.is_some() {
            return false;
        }
        debug!("Abort requested: {}", reason);
        state.reason = Some(reason);
        let interrupt = state.interrupt.take();
        drop(state);

        let _ = self.notify_tx.try_send(());
        if let Some(interrupt) = interrupt {
            interrupt();
        }
        true
    }

    /// Install a hook run once when the abort fires, e.g. to unblock a
    /// pending write. Runs immediately if the abort already fired.
    pub fn set_interrupt(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        if !state.armed {
            return;
        }
        if state.reason.is_some() {
            drop(state);
            hook();
        } else {
            state.interrupt = Some(Box::new(hook));
        }
    }

    /// Stop accepting requests. Returns the recorded reason, if any.
    pub fn disarm(&self) -> Option<AbortReason> {
        let mut state = self.lock();
        state.armed = false;
        state.interrupt = None;
        state.reason.clone()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.lock().reason.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().reason.is_some()
    }

    /// Non-blocking check: `Err` once an abort has been recorded.
    pub fn checkpoint(&self) -> std::result::Result<(), AbortReason> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Becomes ready when an abort fires; for use in `select!`.
    pub fn notified(&self) -> &Receiver<()> {
        &self.notify_rx
    }
}

/// Fires [`AbortReason::Timeout`] on a latch unless cancelled first.
pub struct Watchdog {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(latch: Arc<AbortLatch>, timeout: Duration) -> Result<Self> {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("evalrelay-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    latch.request(AbortReason::Timeout);
                }
            })?;
        Ok(Self {
            cancel: Some(cancel_tx),
            thread: Some(thread),
        })
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_first_request_wins() {
        let latch = AbortLatch::new();
        assert!(latch.checkpoint().is_ok());
        assert!(latch.request(AbortReason::Timeout));
        assert!(!latch.request(AbortReason::ChildExited));
        assert_eq!(latch.checkpoint(), Err(AbortReason::Timeout));
        assert!(latch.notified().try_recv().is_ok());
        assert!(latch.notified().try_recv().is_err());
    }

    #[test]
    fn test_disarmed_latch_ignores_requests() {
        let latch = AbortLatch::new();
        assert_eq!(latch.disarm(), None);
        assert!(!latch.request(AbortReason::Timeout));
        assert!(!latch.is_aborted());
    }

    #[test]
    fn test_concurrent_requests_fire_once() {
        for _ in 0..50 {
            let latch = Arc::new(AbortLatch::new());
            let fired = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = [AbortReason::Timeout, AbortReason::ChildExited, AbortReason::ConnectionClosed]
                .into_iter()
                .map(|reason| {
                    let latch = Arc::clone(&latch);
                    let fired = Arc::clone(&fired);
                    thread::spawn(move || {
                        if latch.request(reason) {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(latch.reason().is_some());
        }
    }

    #[test]
    fn test_interrupt_hook_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));

        let latch = AbortLatch::new();
        let counter = Arc::clone(&runs);
        latch.set_interrupt(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        latch.request(AbortReason::Timeout);
        latch.request(AbortReason::Timeout);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // installed after the fact: runs immediately
        let counter = Arc::clone(&runs);
        latch.set_interrupt(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_watchdog_fires_after_timeout() {
        let latch = Arc::new(AbortLatch::new());
        let started = Instant::now();
        let _watchdog = Watchdog::start(Arc::clone(&latch), Duration::from_millis(50)).unwrap();
        crossbeam_channel::select! {
            recv(latch.notified()) -> _ => {}
            default(Duration::from_secs(5)) => panic!("watchdog never fired"),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(latch.reason(), Some(AbortReason::Timeout));
    }

    #[test]
    fn test_cancelled_watchdog_stays_quiet() {
        let latch = Arc::new(AbortLatch::new());
        let watchdog = Watchdog::start(Arc::clone(&latch), Duration::from_millis(50)).unwrap();
        watchdog.cancel();
        thread::sleep(Duration::from_millis(100));
        assert!(!latch.is_aborted());
    }
}
