//! Shared process-exit reaper.
//!
//! One background thread polls `waitpid(WNOHANG)` for every registered child.
//! Reaping and signalling a child both happen under that child's state lock,
//! so a signal can never reach a recycled pid.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::types::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a watched child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
    /// waitpid no longer knows the pid
    Lost,
}

type ExitCallback = Box<dyn FnOnce(ChildExit) + Send>;

struct WatchState {
    exit: Option<ChildExit>,
    on_exit: Option<ExitCallback>,
}

/// Handle on one registered child.
pub struct ChildWatch {
    pid: Pid,
    state: Mutex<WatchState>,
    exited: Condvar,
}

impl ChildWatch {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn exit(&self) -> Option<ChildExit> {
        self.lock().exit
    }

    /// Wait up to `timeout` for the child to be reaped.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ChildExit> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.exit.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .exited
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.exit
    }

    /// Send `signal` unless the child has already been reaped. Returns
    /// whether a signal was delivered; a vanished process is not an error.
    pub fn signal(&self, signal: Signal) -> Result<bool> {
        let state = self.lock();
        if state.exit.is_some() {
            return Ok(false);
        }
        match kill(self.pid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reap if possible. Returns true once the child is gone.
    fn poll(&self) -> bool {
        let mut state = self.lock();
        if state.exit.is_some() {
            return true;
        }
        let exit = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ChildExit::Signaled(sig as i32),
            Ok(_) | Err(Errno::EINTR) => return false,
            Err(Errno::ECHILD) => ChildExit::Lost,
            Err(e) => {
                warn!("waitpid({}) failed: {}", self.pid, e);
                ChildExit::Lost
            }
        };
        state.exit = Some(exit);
        let callback = state.on_exit.take();
        drop(state);
        self.exited.notify_all();

        debug!("Reaped child {}: {:?}", self.pid, exit);
        if let Some(callback) = callback {
            callback(exit);
        }
        true
    }
}

struct Registry {
    watches: Mutex<Vec<Arc<ChildWatch>>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ChildWatch>>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) {
        let snapshot: Vec<Arc<ChildWatch>> = self.lock().clone();
        let mut finished = Vec::new();
        for watch in snapshot {
            if watch.poll() {
                finished.push(watch.pid);
            }
        }
        if !finished.is_empty() {
            self.lock().retain(|w| !finished.contains(&w.pid));
        }
    }
}

/// Owns the reaper thread. Dropping it stops the thread.
pub struct Reaper {
    registry: Arc<Registry>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn start() -> Result<Self> {
        Self::with_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Result<Self> {
        let registry = Arc::new(Registry {
            watches: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let thread_registry = Arc::clone(&registry);
        let thread = thread::Builder::new()
            .name("evalrelay-reaper".to_string())
            .spawn(move || {
                debug!("Started reaper thread");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => thread_registry.sweep(),
                        _ => break,
                    }
                }
            })?;

        Ok(Self {
            registry,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Start watching `pid`. `on_exit` runs on the reaper thread once, when
    /// the child is reaped.
    pub fn register<F>(&self, pid: Pid, on_exit: F) -> Arc<ChildWatch>
    where
        F: FnOnce(ChildExit) + Send + 'static,
    {
        let watch = Arc::new(ChildWatch {
            pid,
            state: Mutex::new(WatchState {
                exit: None,
                on_exit: Some(Box::new(on_exit)),
            }),
            exited: Condvar::new(),
        });
        self.registry.lock().push(Arc::clone(&watch));
        watch
    }

    /// Children registered and not yet reaped.
    pub fn watched(&self) -> usize {
        self.registry.lock().len()
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let leftover = self.registry.lock().len();
        if leftover > 0 {
            warn!("Reaper stopped with {} children still registered", leftover);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::mpsc;

    fn spawn(program: &str, args: &[&str]) -> Pid {
        let child = Command::new(program).args(args).spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_reaps_and_reports_exit_code() {
        let reaper = Reaper::start().unwrap();
        let (tx, rx) = mpsc::channel();
        let pid = spawn("sh", &["-c", "exit 3"]);
        let watch = reaper.register(pid, move |exit| tx.send(exit).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ChildExit::Exited(3));
        assert_eq!(watch.exit(), Some(ChildExit::Exited(3)));
        assert_eq!(watch.wait_timeout(Duration::from_millis(1)), Some(ChildExit::Exited(3)));
    }

    #[test]
    fn test_signal_then_reap() {
        let reaper = Reaper::start().unwrap();
        let pid = spawn("sleep", &["30"]);
        let watch = reaper.register(pid, |_| {});

        assert_eq!(watch.wait_timeout(Duration::from_millis(50)), None);
        assert!(watch.signal(Signal::SIGKILL).unwrap());
        let exit = watch.wait_timeout(Duration::from_secs(5));
        assert_eq!(exit, Some(ChildExit::Signaled(Signal::SIGKILL as i32)));

        // Already reaped: no signal, no error.
        assert!(!watch.signal(Signal::SIGTERM).unwrap());
    }

    #[test]
    fn test_registry_shrinks_after_reap() {
        let reaper = Reaper::with_interval(Duration::from_millis(5)).unwrap();
        let watch = reaper.register(spawn("true", &[]), |_| {});
        watch.wait_timeout(Duration::from_secs(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while reaper.watched() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reaper.watched(), 0);
    }
}
