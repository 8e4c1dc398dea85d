//! evalrelay: untrusted evaluation requests run in throwaway interpreter processes
//!
//! Each request gets its own resource-limited interpreter child, driven over a
//! framed binary protocol, with per-requester state carried between requests
//! in a bounded in-memory cache and all output funnelled through one
//! rate-limited sender.
//!
//! # Architecture
//!
//! ## Storage ([`store`])
//! - [`store::heap`]: indexed binary min-heap (arbitrary-key delete)
//! - [`store::lru`]: bounded LRU cache on top of the heap
//!
//! ## Flood Protection ([`throttle`])
//! - [`throttle::bucket`]: blocking leaky bucket
//! - [`throttle::outbound`]: drop-oldest outbound queue with refill and sender threads
//!
//! ## Interpreter Bridge ([`protocol`], [`exec`], [`session`])
//! - [`protocol::frame`]: 12-byte header frame codec and command codes
//! - [`protocol::noun`]: literal noun payloads carried by callbacks
//! - [`exec::process`]: child spawn, rendezvous, SIGTERM/SIGKILL teardown
//! - [`exec::limits`]: rlimits, niceness and parent-death signal for the child
//! - [`exec::reaper`]: shared exit reaper
//! - [`session::interpreter`]: the per-request state machine
//! - [`session::abort`]: single-fire abort latch and watchdog
//! - [`session::callback`]: foreign-callback quotas and routing
//!
//! ## Scheduling ([`scheduler`])
//! - [`scheduler::ExecutionScheduler`]: bounded parallelism, no queueing
//!
//! ## Requesters ([`identity`])
//! - [`identity::key`]: session key grammar and ownership rules
//! - [`identity::working`]: working sessions and held continuation lines
//!
//! # Design Principles
//!
//! 1. **One owner per process** - a child belongs to exactly one session and
//!    is reaped before the session reports
//! 2. **Abort once** - many sources may ask, one diagnostic is shown
//! 3. **Bounded everything** - frames, states, callbacks, sessions, output

// Storage
pub mod store;

// Flood Protection
pub mod throttle;

// Interpreter Bridge
pub mod exec;
pub mod protocol;
pub mod session;

// Scheduling
pub mod scheduler;

// Requesters
pub mod identity;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the evalrelay binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use scheduler::{ExecutionScheduler, SessionTicket};
pub use session::interpreter::{SessionOutcome, SessionServices};
