//! Bounded-concurrency session scheduler.
//!
//! Admission is all-or-nothing: a submission beyond `max_parallel` is refused
//! on the spot, before any process exists. Accepted sessions run on their own
//! thread and leave the registry when that thread finishes, however it
//! finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::types::{EvalError, Result};
use crate::identity::key::SessionKey;
use crate::session::interpreter::{InterpreterSession, SessionOutcome, SessionServices};

/// Per-line output callback for a submitted session.
pub type LineCallback = Box<dyn FnMut(&str) + Send>;

/// Snapshot of one running session
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: Uuid,
    pub key: Option<SessionKey>,
    pub commands: usize,
    pub started: Instant,
}

#[derive(Default)]
struct Registry {
    active: Mutex<HashMap<Uuid, SessionInfo>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionInfo>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a session from the registry when dropped.
struct Registration {
    id: Uuid,
    registry: Arc<Registry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.lock().remove(&self.id).is_some() {
            debug!("[{}] deregistered", self.id);
        }
    }
}

/// Completion handle for an accepted submission.
pub struct SessionTicket {
    id: Uuid,
    done: Receiver<SessionOutcome>,
    thread: Option<JoinHandle<()>>,
}

impl SessionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Block until the session completes. `None` only if the session thread
    /// died without reporting.
    pub fn wait(mut self) -> Option<SessionOutcome> {
        let outcome = self.done.recv().ok();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("[{}] session thread panicked", self.id);
            }
        }
        outcome
    }
}

/// Runs interpreter sessions with a hard cap on how many exist at once.
pub struct ExecutionScheduler {
    services: SessionServices,
    registry: Arc<Registry>,
    max_parallel: usize,
}

impl ExecutionScheduler {
    pub fn new(services: SessionServices) -> Self {
        let max_parallel = services.config.scheduler.max_parallel;
        Self {
            services,
            registry: Arc::new(Registry::default()),
            max_parallel,
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Start a session for `commands`, or refuse with
    /// [`EvalError::CapacityExceeded`] when the scheduler is full.
    pub fn submit(
        &self,
        commands: Vec<String>,
        key: Option<SessionKey>,
        mut on_line: LineCallback,
    ) -> Result<SessionTicket> {
        let id = Uuid::new_v4();
        {
            let mut active = self.registry.lock();
            if active.len() >= self.max_parallel {
                warn!(
                    "Rejecting session: {} of {} slots busy",
                    active.len(),
                    self.max_parallel
                );
                return Err(EvalError::CapacityExceeded {
                    active: active.len(),
                    limit: self.max_parallel,
                });
            }
            active.insert(
                id,
                SessionInfo {
                    id,
                    key: key.clone(),
                    commands: commands.len(),
                    started: Instant::now(),
                },
            );
        }
        let registration = Registration {
            id,
            registry: Arc::clone(&self.registry),
        };

        let services = self.services.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name(format!("evalrelay-session-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let registration = registration;
                let outcome = InterpreterSession::with_id(id, &services, key).run(&commands, &mut *on_line);
                drop(registration);
                let _ = done_tx.send(outcome);
            })?;

        info!("[{}] accepted", id);
        Ok(SessionTicket {
            id,
            done: done_rx,
            thread: Some(thread),
        })
    }

    /// Forget the saved state for `key`. Returns whether any existed.
    pub fn clear_session(&self, key: &SessionKey) -> bool {
        self.services.states.delete(key).is_some()
    }

    /// Copy the saved state of `src` to `dst`. A missing `src` clears `dst`
    /// and returns false.
    pub fn copy_session(&self, dst: &SessionKey, src: &SessionKey) -> bool {
        match self.services.states.get(src) {
            Some(state) => {
                self.services.states.set(dst.clone(), state);
                true
            }
            None => {
                self.services.states.delete(dst);
                false
            }
        }
    }

    /// Keys with saved state, least recently used first.
    pub fn list_sessions(&self) -> Vec<SessionKey> {
        self.services.states.keys()
    }

    pub fn active(&self) -> Vec<SessionInfo> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().len()
    }
}
