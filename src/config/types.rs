/// Core configuration and error types for evalrelay
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How the interpreter child is handed its end of the control connection.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Rendezvous {
    /// Pre-connected local socket pair; the trailing argument is the child's fd number.
    #[serde(rename = "socket_pair")]
    SocketPair,
    /// Loopback TCP listener; the trailing argument is the port the child dials back to.
    #[serde(rename = "loopback")]
    Loopback,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Rendezvous::SocketPair
    }
}

/// Interpreter process launch and handshake settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Command template; the rendezvous argument is appended as the last argv entry
    pub command: Vec<String>,
    pub rendezvous: Rendezvous,
    /// Wall-clock budget for one whole request
    pub timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL during teardown
    pub kill_grace_ms: u64,
    /// How long a loopback child may take to dial back
    pub connect_timeout_ms: u64,
    /// Scheduling priority applied in the child
    pub nice: Option<i32>,
    /// Address-space limit in bytes
    pub memory_limit: Option<u64>,
    /// CPU time limit in seconds
    pub cpu_limit_secs: Option<u64>,
    /// Largest payload accepted from the child
    pub max_frame_bytes: u32,
    /// Expression that switches the interpreter into secure evaluation mode
    pub secure_expr: String,
    /// Formatting/geometry expressions sent after the secure-mode switch
    pub init_exprs: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        let output = OutputConfig::default();
        Self {
            command: vec!["jep".to_string(), "-jfd".to_string()],
            rendezvous: Rendezvous::SocketPair,
            timeout_ms: 9_000,
            kill_grace_ms: 2_000,
            connect_timeout_ms: 5_000,
            nice: Some(5),
            memory_limit: Some(32 * 1024 * 1024),
            cpu_limit_secs: Some(600),
            max_frame_bytes: 16 * 1024 * 1024,
            secure_expr: "9!:25]1".to_string(),
            init_exprs: vec![
                "(9!:33]50)](9!:21]2^25)](9!:7]'+++++++++|-')".to_string(),
                geometry_expr(output.width, output.max_lines),
            ],
        }
    }
}

/// Terminal geometry expression for the given display width and line budget.
pub fn geometry_expr(width: usize, lines: usize) -> String {
    format!(
        "(9!:37]0 {} {} 0)]0 0$0",
        width.saturating_sub(4),
        lines.saturating_sub(1)
    )
}

impl InterpreterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Per-request output relaying limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Lines relayed per command; the rest are counted and dropped
    pub max_lines: usize,
    /// Display width in characters
    pub width: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_lines: 6,
            width: 388,
        }
    }
}

/// Persisted interpreter state settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    /// Number of session states kept before LRU eviction
    pub capacity: usize,
    /// Largest serialized state that will be stored
    pub max_state_bytes: usize,
    /// Interpreter variable holding the serialized state
    pub state_var: String,
    /// Expression that serializes the session into `state_var`
    pub dumper: String,
    /// Expression that rebuilds the session from `state_var`
    pub loader: String,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            max_state_bytes: 256 * 1024,
            state_var: "state_jeval_".to_string(),
            dumper: "state_jeval_ =: (,.5!:1)4!:1 i.4".to_string(),
            loader: "4 :('(x)=:y(5!:0)';'0')/\"1 state_jeval_".to_string(),
        }
    }
}

/// Foreign-callback quotas
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Callback requests of any type accepted per session
    pub max_requests: u32,
    /// Query-service callbacks accepted per session
    pub max_queries: u32,
    /// Forward type-1 callbacks to the query service
    pub queries_enabled: bool,
    /// Query text is truncated to this many characters
    pub query_width: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_requests: 4096,
            max_queries: 3,
            queries_enabled: false,
            query_width: 384,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sessions allowed to run at once; extra submissions are rejected
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_parallel: 7 }
    }
}

/// Outbound leaky-bucket settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub capacity: i64,
    pub start_credit: i64,
    pub credit_per_tick: i64,
    pub tick_ms: u64,
    /// Fixed credit charged per message on top of its length
    pub extra_per_line: i64,
    /// Unsent messages kept before the oldest are dropped
    pub queue_bound: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            start_credit: 600,
            credit_per_tick: 100,
            tick_ms: 4_000,
            extra_per_line: 8,
            queue_bound: 128,
        }
    }
}

impl ThrottleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Working-session and held-line bookkeeping limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingConfig {
    pub max_users: usize,
    pub max_per_user: usize,
    pub max_holds: usize,
    pub max_held_lines: usize,
    pub max_held_line_chars: usize,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            max_users: 256,
            max_per_user: 32,
            max_holds: 32,
            max_held_lines: 128,
            max_held_line_chars: 1024,
        }
    }
}

/// Full evalrelay configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub interpreter: InterpreterConfig,
    pub output: OutputConfig,
    pub sessions: SessionStoreConfig,
    pub callbacks: CallbackConfig,
    pub scheduler: SchedulerConfig,
    pub throttle: ThrottleConfig,
    pub working: WorkingConfig,
}

/// Why a session was torn down early. `Display` is the diagnostic line
/// relayed to the requester.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Timeout,
    ChildExited,
    ConnectionClosed,
    WriteFailed,
    SpawnFailed,
    ProtocolViolation(&'static str),
    NeedInput,
    TooManyCallbacks,
    TooManyQueries,
    InvalidCallback,
    CallbackDisabled,
    StateTooLarge,
}

impl AbortReason {
    /// Map the reason onto the error taxonomy.
    pub fn to_error(&self) -> EvalError {
        match self {
            AbortReason::Timeout => EvalError::Timeout,
            AbortReason::ChildExited | AbortReason::ConnectionClosed => EvalError::ChildExited,
            AbortReason::TooManyCallbacks | AbortReason::TooManyQueries => {
                EvalError::QuotaExceeded(self.to_string())
            }
            AbortReason::SpawnFailed => EvalError::Spawn(self.to_string()),
            AbortReason::StateTooLarge => EvalError::ResourceLimitExceeded(self.to_string()),
            _ => EvalError::ProtocolViolation(self.to_string()),
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Timeout => write!(f, "|timeout"),
            AbortReason::ChildExited => write!(f, "|child exited"),
            AbortReason::ConnectionClosed => write!(f, "|connection closed"),
            AbortReason::WriteFailed => write!(f, "|write failed"),
            AbortReason::SpawnFailed => write!(f, "|spawn failed"),
            AbortReason::ProtocolViolation(what) => write!(f, "|protocol error: {}", what),
            AbortReason::NeedInput => write!(f, "|need input"),
            AbortReason::TooManyCallbacks => write!(f, "|too many wd"),
            AbortReason::TooManyQueries => write!(f, "|too many wd1"),
            AbortReason::InvalidCallback => write!(f, "|invalid wd"),
            AbortReason::CallbackDisabled => write!(f, "|disabled wd1"),
            AbortReason::StateTooLarge => write!(f, "|state size error"),
        }
    }
}

/// Custom error types for evalrelay
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Interpreter timed out")]
    Timeout,

    #[error("Interpreter exited unexpectedly")]
    ChildExited,

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Too many concurrent sessions ({active}/{limit})")]
    CapacityExceeded { active: usize, limit: usize },

    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Spawn error: {0}")]
    Spawn(String),
}

impl From<nix::errno::Errno> for EvalError {
    fn from(err: nix::errno::Errno) -> Self {
        EvalError::Io(std::io::Error::from(err))
    }
}

/// Result type alias for evalrelay operations
pub type Result<T> = std::result::Result<T, EvalError>;
