//! One request against one interpreter process.
//!
//! `Init -> Spawning -> Connected -> Handshaking -> Talking -> Done | Aborted`
//!
//! The controlling flow is the only writer on the connection. A reader
//! thread feeds frames into an ordered channel; the watchdog, the reaper and
//! the controlling flow itself may fire the session's [`AbortLatch`], which
//! the controlling flow observes while waiting for the next frame. Teardown
//! runs on every path after the latch is disarmed, and at most one abort
//! diagnostic reaches the output callback.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::types::{AbortReason, EvalConfig, EvalError};
use crate::exec::process::{Connection, Lifecycle, ProcessHandle};
use crate::exec::reaper::Reaper;
use crate::identity::key::SessionKey;
use crate::protocol::frame::{read_frame, write_frame, CommandCode, Frame, FrameError};
use crate::session::abort::{AbortLatch, Watchdog};
use crate::session::callback::{CallbackPolicy, QueryService};
use crate::store::lru::BoundedLruCache;
use crate::utils::text::{escape_control, LineCapture};

/// Saved interpreter states by session key.
pub type StateCache = BoundedLruCache<SessionKey, Vec<u8>>;

/// Line emitted when a request produced no output at all.
pub const OK_LINE: &str = "|ok";

/// Frames the reader may get ahead of the controlling flow.
const FRAME_QUEUE: usize = 16;

/// Long-lived collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<EvalConfig>,
    pub states: Arc<StateCache>,
    pub reaper: Arc<Reaper>,
    pub query: Option<Arc<dyn QueryService>>,
}

impl SessionServices {
    pub fn new(config: EvalConfig) -> crate::config::types::Result<Self> {
        let states = Arc::new(StateCache::new(config.sessions.capacity)?);
        Ok(Self {
            config: Arc::new(config),
            states,
            reaper: Arc::new(Reaper::start()?),
            query: None,
        })
    }

    pub fn with_query_service(mut self, service: Arc<dyn QueryService>) -> Self {
        self.query = Some(service);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Spawning,
    Connected,
    Handshaking,
    Talking,
    Done,
    Aborted,
}

/// What a finished session did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOutcome {
    pub id: Uuid,
    /// `Done` or `Aborted`
    pub phase: SessionPhase,
    pub abort: Option<AbortReason>,
    /// Result lines handed to the callback, diagnostics included
    pub lines_emitted: usize,
    /// Output lines over the per-command budget
    pub lines_dropped: usize,
    pub state_restored: bool,
    pub state_saved: bool,
}

impl SessionOutcome {
    pub fn is_aborted(&self) -> bool {
        self.phase == SessionPhase::Aborted
    }

    pub fn error(&self) -> Option<EvalError> {
        self.abort.as_ref().map(AbortReason::to_error)
    }
}

enum Inbound {
    Frame(Frame),
    Failed(FrameError),
}

/// What the interpreter answered while we waited.
enum Reply {
    /// `DOZ` for a statement: its result code
    Result(u32),
    /// Interpreter is ready; the next line goes out as this command
    Turn(CommandCode),
    /// `GETZ`/`SETZ` payload
    Value(Vec<u8>),
}

type Step<T> = std::result::Result<T, AbortReason>;

/// Output sink for result lines
pub type LineSink<'a> = &'a mut dyn FnMut(&str);

pub struct InterpreterSession<'a> {
    id: Uuid,
    services: &'a SessionServices,
    key: Option<SessionKey>,
    latch: Arc<AbortLatch>,
    phase: SessionPhase,
    emitted: usize,
    dropped: usize,
    restored: bool,
    saved: bool,
}

impl<'a> InterpreterSession<'a> {
    pub fn new(services: &'a SessionServices, key: Option<SessionKey>) -> Self {
        Self::with_id(Uuid::new_v4(), services, key)
    }

    pub fn with_id(id: Uuid, services: &'a SessionServices, key: Option<SessionKey>) -> Self {
        Self {
            id,
            services,
            key,
            latch: Arc::new(AbortLatch::new()),
            phase: SessionPhase::Init,
            emitted: 0,
            dropped: 0,
            restored: false,
            saved: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Shared handle to this session's abort latch.
    pub fn latch(&self) -> Arc<AbortLatch> {
        Arc::clone(&self.latch)
    }

    fn enter(&mut self, phase: SessionPhase) {
        debug!("[{}] {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    fn emit(&mut self, on_line: LineSink<'_>, line: &str) {
        self.emitted += 1;
        on_line(line);
    }

    /// Run `commands` to completion or abort. Never fails: every error ends
    /// as at most one diagnostic line through `on_line`.
    pub fn run(mut self, commands: &[String], on_line: LineSink<'_>) -> SessionOutcome {
        let config = Arc::clone(&self.services.config);
        info!(
            "[{}] session start key={} commands={}",
            self.id,
            self.key.as_ref().map_or("-".to_string(), |k| escape_control(k.as_str())),
            commands.len()
        );
        debug!(
            "[{}] {}",
            self.id,
            commands.iter().map(|c| escape_control(c)).collect::<Vec<_>>().join("~%")
        );

        let result = match Watchdog::start(self.latch(), config.interpreter.timeout()) {
            Ok(watchdog) => {
                let result = self.spawn_and_talk(&config, commands, on_line);
                watchdog.cancel();
                result
            }
            Err(e) => {
                warn!("[{}] watchdog unavailable: {}", self.id, e);
                Err(AbortReason::SpawnFailed)
            }
        };

        // Completed flows ignore a late abort; failed flows report the first one.
        let recorded = self.latch.disarm();
        let abort = match result {
            Ok(()) => None,
            Err(reason) => Some(recorded.unwrap_or(reason)),
        };

        match &abort {
            None => self.enter(SessionPhase::Done),
            Some(reason) => {
                self.enter(SessionPhase::Aborted);
                let line = reason.to_string();
                self.emit(on_line, &line);
            }
        }
        info!(
            "[{}] session end {:?} abort={:?} lines={} dropped={}",
            self.id, self.phase, abort, self.emitted, self.dropped
        );

        SessionOutcome {
            id: self.id,
            phase: self.phase,
            abort,
            lines_emitted: self.emitted,
            lines_dropped: self.dropped,
            state_restored: self.restored,
            state_saved: self.saved,
        }
    }

    fn spawn_and_talk(&mut self, config: &EvalConfig, commands: &[String], on_line: LineSink<'_>) -> Step<()> {
        self.enter(SessionPhase::Spawning);
        let exit_latch = self.latch();
        let spawn_latch = self.latch();
        let spawned = ProcessHandle::spawn(
            &config.interpreter,
            &self.services.reaper,
            move |exit| {
                debug!("interpreter exited: {:?}", exit);
                exit_latch.request(AbortReason::ChildExited);
            },
            &|| spawn_latch.is_aborted(),
        );
        let mut process = match spawned {
            Ok(process) => process,
            Err(e) => {
                warn!("[{}] spawn failed: {}", self.id, e);
                let reason = match e {
                    EvalError::Timeout => AbortReason::Timeout,
                    EvalError::ChildExited => AbortReason::ChildExited,
                    _ => AbortReason::SpawnFailed,
                };
                self.latch.request(reason.clone());
                return Err(reason);
            }
        };
        self.enter(SessionPhase::Connected);

        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE);
        let channels = process.reader().and_then(|read_conn| {
            let write_conn = process.reader()?;
            if let Ok(hook_conn) = process.reader() {
                // Unblocks a write stuck on a child that stopped reading.
                self.latch.set_interrupt(move || {
                    let _ = hook_conn.shutdown();
                });
            }
            let reader = spawn_reader(self.id, read_conn, config.interpreter.max_frame_bytes, tx)?;
            Ok((write_conn, reader))
        });
        let (write_conn, reader) = match channels {
            Ok(channels) => channels,
            Err(e) => {
                warn!("[{}] connection setup failed: {}", self.id, e);
                self.latch.request(AbortReason::SpawnFailed);
                return Err(AbortReason::SpawnFailed);
            }
        };

        let mut conversation = Conversation {
            id: self.id,
            conn: write_conn,
            frames: rx,
            latch: self.latch(),
            callbacks: CallbackPolicy::new(&config.callbacks, self.services.query.clone()),
            output: LineCapture::new(config.output.max_lines, config.output.width),
        };
        let result = self.converse(&mut conversation, &mut process, config, commands, on_line);
        drop(conversation);

        // Teardown: nothing below may be interrupted.
        self.latch.disarm();
        let report = process.terminate();
        debug!("[{}] teardown {:?}", self.id, report);
        if reader.join().is_err() {
            warn!("[{}] reader thread panicked", self.id);
        }
        result
    }

    fn converse(
        &mut self,
        conv: &mut Conversation,
        process: &mut ProcessHandle,
        config: &EvalConfig,
        commands: &[String],
        on_line: LineSink<'_>,
    ) -> Step<()> {
        self.enter(SessionPhase::Handshaking);
        process.set_lifecycle(Lifecycle::Handshaking);
        conv.handshake(config)?;

        self.enter(SessionPhase::Talking);
        process.set_lifecycle(Lifecycle::Running);
        if let Some(key) = self.key.clone() {
            if let Some(state) = self.services.states.get(&key) {
                conv.restore(config, &state)?;
                self.restored = true;
                debug!("[{}] restored {} bytes for {}", self.id, state.len(), key);
            }
        }

        let mut want = CommandCode::Do;
        let mut produced = 0usize;
        for command in commands {
            conv.output.clear();
            conv.send(want, 0, command.as_bytes())?;
            want = conv.await_turn()?;

            let (lines, dropped) = conv.output.finish();
            produced += lines.len() + dropped;
            self.dropped += dropped;
            for line in &lines {
                self.emit(on_line, line);
            }
        }
        if want != CommandCode::Do {
            return Err(conv.abort(AbortReason::NeedInput));
        }
        if produced == 0 {
            self.emit(on_line, OK_LINE);
        }

        if let Some(key) = self.key.clone() {
            let state = conv.save(config)?;
            if state.len() >= config.sessions.max_state_bytes {
                warn!(
                    "[{}] state for {} is {} bytes, limit {}",
                    self.id,
                    key,
                    state.len(),
                    config.sessions.max_state_bytes
                );
                return Err(conv.abort(AbortReason::StateTooLarge));
            }
            debug!("[{}] saved {} bytes for {}", self.id, state.len(), key);
            self.services.states.set(key, state);
            self.saved = true;
        }
        Ok(())
    }
}

fn spawn_reader(
    id: Uuid,
    mut conn: Connection,
    max_frame_bytes: u32,
    tx: Sender<Inbound>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("evalrelay-read-{}", &id.simple().to_string()[..8]))
        .spawn(move || loop {
            match read_frame(&mut conn, max_frame_bytes) {
                Ok(frame) => {
                    debug!("[{}] <- {} tag={} len={}", id, frame.code, frame.tag, frame.payload.len());
                    if tx.send(Inbound::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("[{}] reader stopped: {}", id, e);
                    let _ = tx.send(Inbound::Failed(e));
                    break;
                }
            }
        })
}

/// The frame exchange proper.
struct Conversation {
    id: Uuid,
    conn: Connection,
    frames: Receiver<Inbound>,
    latch: Arc<AbortLatch>,
    callbacks: CallbackPolicy,
    output: LineCapture,
}

impl Conversation {
    fn abort(&self, reason: AbortReason) -> AbortReason {
        self.latch.request(reason.clone());
        reason
    }

    fn violation(&self, what: &'static str) -> AbortReason {
        warn!("[{}] protocol violation: {}", self.id, what);
        self.abort(AbortReason::ProtocolViolation(what))
    }

    fn send(&mut self, code: CommandCode, tag: u32, payload: &[u8]) -> Step<()> {
        debug!("[{}] -> {} tag={} len={}", self.id, code, tag, payload.len());
        let frame = Frame::new(code, tag, payload);
        write_frame(&mut self.conn, &frame).map_err(|e| {
            debug!("[{}] write failed: {}", self.id, e);
            self.abort(AbortReason::WriteFailed)
        })
    }

    /// The single interruption point.
    fn next_frame(&mut self) -> Step<Frame> {
        self.latch.checkpoint()?;
        select! {
            recv(self.frames) -> inbound => match inbound {
                Ok(Inbound::Frame(frame)) => Ok(frame),
                Ok(Inbound::Failed(e)) => Err(match e {
                    FrameError::UnknownCode(_) => self.violation("unknown command code"),
                    FrameError::ReservedBits => self.violation("reserved header bytes set"),
                    FrameError::TooLarge { .. } => self.violation("oversized frame"),
                    _ => self.abort(AbortReason::ConnectionClosed),
                }),
                Err(_) => Err(self.abort(AbortReason::ConnectionClosed)),
            },
            recv(self.latch.notified()) -> _ => {
                Err(self.latch.reason().unwrap_or(AbortReason::ConnectionClosed))
            }
        }
    }

    /// Pump frames until the reply `expect` calls for arrives.
    fn await_reply(&mut self, expect: CommandCode) -> Step<Reply> {
        loop {
            let frame = self.next_frame()?;
            match frame.code {
                CommandCode::DoAck => match expect {
                    CommandCode::DoAck => return Ok(Reply::Result(frame.tag)),
                    CommandCode::Input => return Ok(Reply::Turn(CommandCode::Do)),
                    _ => return Err(self.violation("unexpected statement result")),
                },
                CommandCode::GetAck | CommandCode::SetAck => {
                    if frame.code != expect {
                        return Err(self.violation("unexpected variable reply"));
                    }
                    if frame.tag != 0 {
                        return Err(self.violation("variable transfer failed"));
                    }
                    return Ok(Reply::Value(frame.payload));
                }
                CommandCode::Output => self.output.push(&frame.payload),
                CommandCode::Exit => debug!("[{}] interpreter announced exit", self.id),
                CommandCode::Input => {
                    if expect != CommandCode::Input {
                        return Err(self.violation("unexpected input request"));
                    }
                    return Ok(Reply::Turn(CommandCode::InputAck));
                }
                CommandCode::Callback => {
                    let reply = self
                        .callbacks
                        .handle(frame.tag, &frame.payload)
                        .map_err(|reason| self.abort(reason))?;
                    self.send(CommandCode::CallbackAck, reply.tag, &reply.payload)?;
                }
                _ => return Err(self.violation("unexpected command code")),
            }
        }
    }

    fn await_result(&mut self) -> Step<u32> {
        match self.await_reply(CommandCode::DoAck)? {
            Reply::Result(code) => Ok(code),
            _ => Err(self.violation("unexpected reply")),
        }
    }

    fn await_turn(&mut self) -> Step<CommandCode> {
        match self.await_reply(CommandCode::Input)? {
            Reply::Turn(next) => Ok(next),
            _ => Err(self.violation("unexpected reply")),
        }
    }

    fn await_value(&mut self, expect: CommandCode) -> Step<Vec<u8>> {
        match self.await_reply(expect)? {
            Reply::Value(value) => Ok(value),
            _ => Err(self.violation("unexpected reply")),
        }
    }

    /// Evaluate `expr` and require a zero result code.
    fn evaluate(&mut self, expr: &str, failure: &'static str) -> Step<()> {
        self.send(CommandCode::Do, 0, expr.as_bytes())?;
        match self.await_result()? {
            0 => Ok(()),
            code => {
                debug!("[{}] {:?} returned {}", self.id, escape_control(expr), code);
                Err(self.violation(failure))
            }
        }
    }

    fn handshake(&mut self, config: &EvalConfig) -> Step<()> {
        self.evaluate(&config.interpreter.secure_expr, "secure mode refused")?;
        for expr in &config.interpreter.init_exprs {
            self.evaluate(expr, "initialization refused")?;
        }
        // Handshake output is not part of any command's result.
        self.output.clear();
        Ok(())
    }

    fn restore(&mut self, config: &EvalConfig, state: &[u8]) -> Step<()> {
        let sessions = &config.sessions;
        self.send(CommandCode::SetName, 0, sessions.state_var.as_bytes())?;
        self.send(CommandCode::Set, 0, state)?;
        self.await_value(CommandCode::SetAck)?;
        self.evaluate(&sessions.loader, "state loader failed")?;
        self.output.clear();
        Ok(())
    }

    fn save(&mut self, config: &EvalConfig) -> Step<Vec<u8>> {
        let sessions = &config.sessions;
        self.evaluate(&sessions.dumper, "state dumper failed")?;
        self.send(CommandCode::Get, 0, sessions.state_var.as_bytes())?;
        self.await_value(CommandCode::GetAck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::noun::{encode_literal, WordLayout};

    #[test]
    fn test_outcome_error_mapping() {
        let outcome = SessionOutcome {
            id: Uuid::nil(),
            phase: SessionPhase::Aborted,
            abort: Some(AbortReason::StateTooLarge),
            lines_emitted: 1,
            lines_dropped: 0,
            state_restored: false,
            state_saved: false,
        };
        assert!(outcome.is_aborted());
        assert!(matches!(outcome.error(), Some(EvalError::ResourceLimitExceeded(_))));
    }

    /// Drives a Conversation against a scripted peer on a socket pair.
    fn scripted<F>(peer: F) -> (Conversation, JoinHandle<()>)
    where
        F: FnOnce(&mut std::os::unix::net::UnixStream) + Send + 'static,
    {
        let (ours, mut theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let peer = thread::spawn(move || peer(&mut theirs));
        let conn = Connection::Unix(ours);
        let reader_conn = conn.try_clone().unwrap();
        let latch = Arc::new(AbortLatch::new());
        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE);
        spawn_reader(Uuid::nil(), reader_conn, 1 << 20, tx).unwrap();
        let conversation = Conversation {
            id: Uuid::nil(),
            conn,
            frames: rx,
            latch,
            callbacks: CallbackPolicy::new(&Default::default(), None),
            output: LineCapture::new(6, 80),
        };
        (conversation, peer)
    }

    fn reply(stream: &mut std::os::unix::net::UnixStream, frame: Frame) {
        write_frame(stream, &frame).unwrap();
    }

    fn expect(stream: &mut std::os::unix::net::UnixStream, code: CommandCode) -> Frame {
        let frame = read_frame(stream, 1 << 20).unwrap();
        assert_eq!(frame.code, code);
        frame
    }

    #[test]
    fn test_turn_collects_output_and_answers_callbacks() {
        let (mut conv, peer) = scripted(|s| {
            expect(s, CommandCode::Do);
            reply(s, Frame::new(CommandCode::Output, 1, "a\nb\n"));
            reply(s, Frame::new(CommandCode::Callback, 0, encode_literal(WordLayout::Le64, b"wd!")));
            let ack = expect(s, CommandCode::CallbackAck);
            assert_eq!(ack.payload, b"wd!");
            reply(s, Frame::new(CommandCode::Input, 0, "   "));
        });
        conv.send(CommandCode::Do, 0, b"1+1").unwrap();
        assert_eq!(conv.await_turn().unwrap(), CommandCode::InputAck);
        assert_eq!(conv.output.finish(), (vec!["a".to_string(), "b".to_string()], 0));
        peer.join().unwrap();
    }

    #[test]
    fn test_output_flood_is_not_buffered() {
        let (mut conv, peer) = scripted(|s| {
            expect(s, CommandCode::Do);
            let mut chunk = vec![b'x'; 4095];
            chunk.push(b'\n');
            for _ in 0..4000 {
                reply(s, Frame::new(CommandCode::Output, 2, chunk.clone()));
            }
            reply(s, Frame::new(CommandCode::Input, 0, "   "));
        });
        conv.send(CommandCode::Do, 0, b"flood").unwrap();
        assert_eq!(conv.await_turn().unwrap(), CommandCode::InputAck);
        assert!(conv.output.buffered_bytes() <= 6 * 80 + 4 * 80);

        let (lines, dropped) = conv.output.finish();
        assert_eq!(lines.len(), 6);
        assert!(lines.iter().all(|line| line.len() == 80));
        assert_eq!(dropped, 3994);
        peer.join().unwrap();
    }

    #[test]
    fn test_result_code_returned_for_statement() {
        let (mut conv, peer) = scripted(|s| {
            expect(s, CommandCode::Do);
            reply(s, Frame::bare(CommandCode::DoAck, 21));
        });
        conv.send(CommandCode::Do, 0, b"x").unwrap();
        assert_eq!(conv.await_result().unwrap(), 21);
        peer.join().unwrap();
    }

    #[test]
    fn test_out_of_place_reply_is_violation() {
        let (mut conv, peer) = scripted(|s| {
            reply(s, Frame::bare(CommandCode::SetAck, 0));
        });
        let err = conv.await_result().unwrap_err();
        assert!(matches!(err, AbortReason::ProtocolViolation(_)));
        assert_eq!(conv.latch.reason(), Some(err));
        peer.join().unwrap();
    }

    #[test]
    fn test_nonzero_variable_reply_is_violation() {
        let (mut conv, peer) = scripted(|s| {
            reply(s, Frame::bare(CommandCode::GetAck, 3));
        });
        assert!(matches!(
            conv.await_value(CommandCode::GetAck),
            Err(AbortReason::ProtocolViolation("variable transfer failed"))
        ));
        peer.join().unwrap();
    }

    #[test]
    fn test_closed_connection_aborts() {
        let (mut conv, peer) = scripted(|_| {});
        peer.join().unwrap();
        assert_eq!(conv.await_result(), Err(AbortReason::ConnectionClosed));
    }

    #[test]
    fn test_pending_abort_wins_over_queued_frames() {
        let (mut conv, peer) = scripted(|s| {
            reply(s, Frame::bare(CommandCode::DoAck, 0));
        });
        peer.join().unwrap();
        conv.latch.request(AbortReason::Timeout);
        assert_eq!(conv.await_result(), Err(AbortReason::Timeout));
    }
}
