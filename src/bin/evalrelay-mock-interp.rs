//! Scripted stand-in for the interpreter bridge.
//!
//! Speaks the frame protocol on the rendezvous channel and runs a tiny
//! line language, one statement per evaluate request:
//!
//! `echo N`, `say TEXT`, `sleep MS`, `exit`, `ask`, `wd TEXT`, `wdq TEXT`,
//! `wdx`, `bogus`, `fail`, `put TEXT`, `show`, `big N`, `dump [VAR]`,
//! `load [VAR]`. Anything else evaluates to nothing with result 0.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, info};

use evalrelay::protocol::noun::{encode_literal, WordLayout};
use evalrelay::protocol::{read_frame, write_frame, CommandCode, Frame, FrameError};

const DEFAULT_STATE_VAR: &str = "state_jeval_";
const MAX_FRAME: u32 = 64 * 1024 * 1024;
/// Output kind tag for formatted results
const OUTPUT_FORMATTED: u32 = 2;

#[derive(Parser)]
#[command(name = "evalrelay-mock-interp", version, about = "Scripted interpreter for evalrelay")]
struct Args {
    /// `-jfd N` or `-jconnect [host:]port`
    #[arg(num_args = 2, trailing_var_arg = true, allow_hyphen_values = true, value_names = ["MODE", "TARGET"])]
    rendezvous: Vec<String>,
}

trait Channel: Read + Write {}
impl<T: Read + Write> Channel for T {}

fn connect(args: &Args) -> Result<Box<dyn Channel>> {
    match args.rendezvous.as_slice() {
        [mode, fd] if mode == "-jfd" => {
            let fd: i32 = fd.parse().with_context(|| format!("bad descriptor {:?}", fd))?;
            // SAFETY: the parent handed us this descriptor and nothing else owns it.
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            Ok(Box::new(stream))
        }
        [mode, target] if mode == "-jconnect" => {
            let addr = if target.contains(':') {
                target.clone()
            } else {
                format!("127.0.0.1:{}", target)
            };
            let stream = TcpStream::connect(&addr).with_context(|| format!("connect {}", addr))?;
            Ok(Box::new(stream))
        }
        other => bail!("expected -jfd N or -jconnect [host:]port, got {:?}", other),
    }
}

/// How a statement finished.
enum Completion {
    Result(u32),
    /// Process exits without answering
    Exit,
    /// Reply already sent
    Silent,
}

struct Mock {
    chan: Box<dyn Channel>,
    vars: HashMap<String, Vec<u8>>,
    state: Vec<u8>,
    pending_name: Option<String>,
}

impl Mock {
    fn send(&mut self, frame: Frame) -> Result<()> {
        write_frame(&mut self.chan, &frame)?;
        Ok(())
    }

    fn output(&mut self, text: impl Into<Vec<u8>>) -> Result<()> {
        self.send(Frame::new(CommandCode::Output, OUTPUT_FORMATTED, text))
    }

    /// Read frames until one with `code` arrives, serving variable traffic
    /// in between.
    fn expect(&mut self, code: CommandCode) -> Result<Frame> {
        loop {
            let frame = read_frame(&mut self.chan, MAX_FRAME)?;
            if frame.code == code {
                return Ok(frame);
            }
            if !self.serve_variable(&frame)? {
                bail!("expected {}, got {}", code, frame.code);
            }
        }
    }

    fn serve_variable(&mut self, frame: &Frame) -> Result<bool> {
        match frame.code {
            CommandCode::Get => {
                let name = String::from_utf8_lossy(&frame.payload).into_owned();
                let reply = match self.vars.get(&name) {
                    Some(value) => Frame::new(CommandCode::GetAck, 0, value.clone()),
                    None => Frame::bare(CommandCode::GetAck, 1),
                };
                self.send(reply)?;
            }
            CommandCode::SetName => {
                self.pending_name = Some(String::from_utf8_lossy(&frame.payload).into_owned());
            }
            CommandCode::Set => {
                let tag = match self.pending_name.take() {
                    Some(name) => {
                        self.vars.insert(name, frame.payload.clone());
                        0
                    }
                    None => 1,
                };
                self.send(Frame::bare(CommandCode::SetAck, tag))?;
            }
            CommandCode::Break | CommandCode::Edit | CommandCode::File => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn callback(&mut self, kind: u32, text: &str) -> Result<Frame> {
        self.send(Frame::new(
            CommandCode::Callback,
            kind,
            encode_literal(WordLayout::Le64, text.as_bytes()),
        ))?;
        self.expect(CommandCode::CallbackAck)
    }

    fn run(&mut self, statement: &str) -> Result<Completion> {
        let (verb, rest) = statement.split_once(' ').unwrap_or((statement, ""));
        match verb {
            "echo" => {
                let count: usize = rest.trim().parse().unwrap_or(1);
                let text: String = (1..=count).map(|i| format!("line {}\n", i)).collect();
                self.output(text)?;
            }
            "say" => self.output(format!("{}\n", rest))?,
            "sleep" => thread::sleep(Duration::from_millis(rest.trim().parse().unwrap_or(0))),
            "exit" => {
                self.send(Frame::bare(CommandCode::Exit, 0))?;
                return Ok(Completion::Exit);
            }
            "ask" => {
                self.send(Frame::new(CommandCode::Input, 0, "   "))?;
                let answer = self.expect(CommandCode::InputAck)?;
                let answer = String::from_utf8_lossy(&answer.payload).into_owned();
                self.output(format!("got {}\n", answer))?;
            }
            "wd" => {
                let ack = self.callback(0, rest)?;
                let mut line = b"wd ".to_vec();
                line.extend_from_slice(&ack.payload);
                line.push(b'\n');
                self.output(line)?;
            }
            "wdq" => {
                let ack = self.callback(1, rest)?;
                let mut line = format!("wdq {} ", ack.tag).into_bytes();
                line.extend_from_slice(&ack.payload);
                line.push(b'\n');
                self.output(line)?;
            }
            "wdx" => {
                self.callback(7, "x")?;
            }
            "bogus" => {
                self.send(Frame::bare(CommandCode::SetAck, 0))?;
                return Ok(Completion::Silent);
            }
            "fail" => return Ok(Completion::Result(3)),
            "put" => {
                self.state.extend_from_slice(rest.as_bytes());
                self.state.push(b'\n');
            }
            "show" => {
                if self.state.is_empty() {
                    self.output("(empty)\n")?;
                } else {
                    let state = self.state.clone();
                    self.output(state)?;
                }
            }
            "big" => self.state = vec![b'x'; rest.trim().parse().unwrap_or(0)],
            "dump" => {
                let var = if rest.is_empty() { DEFAULT_STATE_VAR } else { rest };
                self.vars.insert(var.to_string(), self.state.clone());
            }
            "load" => {
                let var = if rest.is_empty() { DEFAULT_STATE_VAR } else { rest };
                match self.vars.get(var) {
                    Some(state) => self.state = state.clone(),
                    None => return Ok(Completion::Result(1)),
                }
            }
            _ => debug!("ignoring {:?}", statement),
        }
        Ok(Completion::Result(0))
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let frame = match read_frame(&mut self.chan, MAX_FRAME) {
                Ok(frame) => frame,
                Err(FrameError::Closed) => return Ok(()),
                Err(e) => return Err(anyhow!(e)),
            };
            match frame.code {
                CommandCode::Do | CommandCode::InputAck => {
                    let statement = String::from_utf8_lossy(&frame.payload).into_owned();
                    match self.run(&statement)? {
                        Completion::Result(code) => self.send(Frame::bare(CommandCode::DoAck, code))?,
                        Completion::Exit => return Ok(()),
                        Completion::Silent => {}
                    }
                }
                _ => {
                    if !self.serve_variable(&frame)? {
                        bail!("unexpected {}", frame.code);
                    }
                }
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let chan = connect(&args)?;
    info!("mock interpreter {} up", std::process::id());
    let mut mock = Mock {
        chan,
        vars: HashMap::new(),
        state: Vec::new(),
        pending_name: None,
    };
    mock.serve()
}
