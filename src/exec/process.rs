//! Interpreter child process: spawn, rendezvous, lifecycle, teardown.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::types::{EvalError, InterpreterConfig, Rendezvous, Result};
use crate::exec::limits::{inherit_fd, ChildLimits};
use crate::exec::reaper::{ChildExit, ChildWatch, Reaper};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
/// Upper bound on waiting for the reap after SIGKILL
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle tag of a [`ProcessHandle`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Spawning,
    Connected,
    Handshaking,
    Running,
    Terminating,
    Dead,
}

/// Control connection to the child
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connection {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Connection::Unix(s) => s.try_clone().map(Connection::Unix),
            Connection::Tcp(s) => s.try_clone().map(Connection::Tcp),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Connection::Unix(s) => s.shutdown(Shutdown::Both),
            Connection::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(s) => s.read(buf),
            Connection::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Unix(s) => s.write(buf),
            Connection::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Unix(s) => s.flush(),
            Connection::Tcp(s) => s.flush(),
        }
    }
}

/// What teardown had to do
#[derive(Clone, Debug, Default)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub exit: Option<ChildExit>,
    pub waited_ms: u64,
}

/// One running interpreter. Dropping the handle tears the child down.
pub struct ProcessHandle {
    watch: Arc<ChildWatch>,
    conn: Connection,
    lifecycle: Lifecycle,
    kill_grace: Duration,
}

impl ProcessHandle {
    /// Launch the interpreter and complete the rendezvous.
    ///
    /// `on_exit` fires on the reaper thread when the child is reaped.
    /// `cancelled` is polled while waiting for a loopback child to dial in.
    pub fn spawn<F>(
        config: &InterpreterConfig,
        reaper: &Reaper,
        on_exit: F,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Self>
    where
        F: FnOnce(ChildExit) + Send + 'static,
    {
        let (program, template_args) = config
            .command
            .split_first()
            .ok_or_else(|| EvalError::Config("empty interpreter command".to_string()))?;
        let limits = ChildLimits::from_config(config);

        let mut command = Command::new(program);
        command
            .args(template_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        match config.rendezvous {
            Rendezvous::SocketPair => {
                let (parent_end, child_end) = UnixStream::pair()?;
                let child_fd = child_end.as_raw_fd();
                command.arg(child_fd.to_string());
                // SAFETY: the hook only makes async-signal-safe syscalls.
                unsafe {
                    command.pre_exec(move || {
                        inherit_fd(child_fd)?;
                        limits.apply()
                    });
                }
                let watch = launch(&mut command, reaper, on_exit, &limits)?;
                drop(child_end);
                Ok(Self::connected(watch, Connection::Unix(parent_end), config))
            }
            Rendezvous::Loopback => {
                let listener = TcpListener::bind(("127.0.0.1", 0))?;
                let port = listener.local_addr()?.port();
                command.arg(port.to_string());
                // SAFETY: the hook only makes async-signal-safe syscalls.
                unsafe {
                    command.pre_exec(move || limits.apply());
                }
                let watch = launch(&mut command, reaper, on_exit, &limits)?;
                match accept_child(&listener, &watch, config.connect_timeout(), cancelled) {
                    Ok(stream) => Ok(Self::connected(watch, Connection::Tcp(stream), config)),
                    Err(e) => {
                        terminate_child(&watch, config.kill_grace());
                        Err(e)
                    }
                }
            }
        }
    }

    fn connected(watch: Arc<ChildWatch>, conn: Connection, config: &InterpreterConfig) -> Self {
        debug!("Interpreter {} connected", watch.pid());
        Self {
            watch,
            conn,
            lifecycle: Lifecycle::Connected,
            kill_grace: config.kill_grace(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.watch.pid()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Independent handle for the reader thread.
    pub fn reader(&self) -> io::Result<Connection> {
        self.conn.try_clone()
    }

    pub fn exit_status(&self) -> Option<ChildExit> {
        self.watch.exit()
    }

    /// SIGTERM, grace period, SIGKILL. Idempotent.
    pub fn terminate(&mut self) -> KillReport {
        if self.lifecycle == Lifecycle::Dead {
            return KillReport {
                exit: self.watch.exit(),
                ..KillReport::default()
            };
        }
        self.lifecycle = Lifecycle::Terminating;
        let _ = self.conn.shutdown();
        let report = terminate_child(&self.watch, self.kill_grace);
        self.lifecycle = Lifecycle::Dead;
        report
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.lifecycle != Lifecycle::Dead {
            self.terminate();
        }
    }
}

fn launch<F>(
    command: &mut Command,
    reaper: &Reaper,
    on_exit: F,
    limits: &ChildLimits,
) -> Result<Arc<ChildWatch>>
where
    F: FnOnce(ChildExit) + Send + 'static,
{
    let child = command
        .spawn()
        .map_err(|e| EvalError::Spawn(format!("{:?}: {}", command.get_program(), e)))?;
    let pid = Pid::from_raw(child.id() as i32);
    // The reaper owns waiting from here on.
    drop(child);
    info!("Spawned interpreter {} ({})", pid, limits.describe());
    Ok(reaper.register(pid, on_exit))
}

fn accept_child(
    listener: &TcpListener,
    watch: &ChildWatch,
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                debug!("Interpreter {} dialled back from {}", watch.pid(), peer);
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if watch.exit().is_some() {
                    return Err(EvalError::ChildExited);
                }
                if cancelled() || Instant::now() >= deadline {
                    return Err(EvalError::Timeout);
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Terminate a child that may already be gone.
fn terminate_child(watch: &ChildWatch, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    match watch.signal(Signal::SIGTERM) {
        Ok(sent) => report.term_sent = sent,
        Err(e) => warn!("SIGTERM to {} failed: {}", watch.pid(), e),
    }

    report.exit = watch.wait_timeout(grace);
    if report.exit.is_none() {
        match watch.signal(Signal::SIGKILL) {
            Ok(sent) => report.kill_sent = sent,
            Err(e) => warn!("SIGKILL to {} failed: {}", watch.pid(), e),
        }
        report.exit = watch.wait_timeout(KILL_REAP_TIMEOUT);
        if report.exit.is_none() {
            warn!("Interpreter {} not reaped after SIGKILL", watch.pid());
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    debug!(
        "Terminated interpreter {}: term={} kill={} exit={:?} in {}ms",
        watch.pid(),
        report.term_sent,
        report.kill_sent,
        report.exit,
        report.waited_ms
    );
    report
}
