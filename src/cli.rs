use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use crate::config::types::{EvalConfig, EvalError};
use crate::identity::key::{expand_session_key, Requester, SessionKey};
use crate::identity::working::{Hold, HoldBuffer, WorkingSessions};
use crate::scheduler::ExecutionScheduler;
use crate::session::interpreter::SessionServices;
use crate::throttle::outbound::{Throttle, ThrottleHandle};
use crate::utils::text::escape_control;

/// Line sent instead of running when every slot is busy.
pub const BUSY_LINE: &str = "|ask later";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate command lines in one session and print the result lines
    Eval {
        /// Requester name used to build the session key
        #[arg(long, default_value = "local")]
        user: String,
        /// Channel the request came from; private when omitted
        #[arg(long)]
        channel: Option<String>,
        /// Session key override (`[owner,]suffix`)
        #[arg(long)]
        key: Option<String>,
        /// Run without restoring or saving session state
        #[arg(long)]
        stateless: bool,
        /// Command lines, one per argument
        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Read `user channel text` requests from stdin, relay results to stdout
    Serve {
        /// Requesters allowed to write other owners' sessions
        #[arg(long = "admin", value_name = "USER")]
        admins: Vec<String>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn load_config(path: Option<&Path>) -> Result<EvalConfig> {
    let config = match path {
        Some(path) => EvalConfig::load_from_file(path)?,
        None => {
            let config = EvalConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Eval {
            user,
            channel,
            key,
            stateless,
            commands,
        } => {
            let requester = Requester::new(user, channel.as_deref());
            let key = if stateless {
                None
            } else {
                Some(expand_session_key(&requester, key.as_deref().unwrap_or(""), false)?)
            };
            let scheduler = ExecutionScheduler::new(SessionServices::new(config)?);
            let ticket = match scheduler.submit(commands, key, Box::new(|line: &str| println!("{}", line))) {
                Ok(ticket) => ticket,
                Err(EvalError::CapacityExceeded { .. }) => {
                    println!("{}", BUSY_LINE);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let outcome = ticket
                .wait()
                .ok_or_else(|| anyhow::anyhow!("session ended without an outcome"))?;
            if let Some(error) = outcome.error() {
                log::info!("Session {} aborted: {}", outcome.id, error);
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Serve { admins } => serve(config, &admins),
    }
}

/// Per-line front end state for `serve`.
struct Frontend {
    scheduler: ExecutionScheduler,
    working: WorkingSessions,
    holds: HoldBuffer,
    out: ThrottleHandle,
    admins: Vec<String>,
}

impl Frontend {
    fn reply(&self, requester: &Requester, line: &str) {
        let target = requester.channel.as_deref().unwrap_or(&requester.user);
        self.out.send(&format!("{} {}", target, line));
    }

    fn key_arg(&self, requester: &Requester, arg: &str, read_only: bool) -> crate::config::types::Result<SessionKey> {
        if arg.is_empty() {
            self.working.current(requester)
        } else {
            expand_session_key(requester, arg, read_only)
        }
    }

    /// `!`-prefixed session management commands.
    fn command(&self, requester: &Requester, text: &str) -> crate::config::types::Result<()> {
        let (verb, arg) = text.split_once(' ').unwrap_or((text, ""));
        let arg = arg.trim();
        match verb {
            "!session" => {
                let key = if arg.is_empty() {
                    self.working.reset(requester)?
                } else {
                    self.working.set_working(requester, arg)?
                };
                self.reply(requester, &format!("|session {}", key));
            }
            "!clear" => {
                let key = self.key_arg(requester, arg, false)?;
                self.scheduler.clear_session(&key);
                self.reply(requester, &format!("|cleared {}", key));
            }
            "!copy" => {
                let src = self.key_arg(requester, arg, true)?;
                let dst = self.working.current(requester)?;
                let line = if self.scheduler.copy_session(&dst, &src) {
                    format!("|copied {} to {}", src, dst)
                } else {
                    format!("|no session {}", src)
                };
                self.reply(requester, &line);
            }
            "!list" => {
                let keys: Vec<String> = self
                    .scheduler
                    .list_sessions()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                self.reply(requester, &format!("|sessions {}", keys.join(" ")));
            }
            "!hold" => match self.holds.hold(requester, arg) {
                Hold::Kept => {}
                Hold::TooMany => self.reply(requester, "|too many held lines"),
                Hold::TooLong => self.reply(requester, "|held line too long"),
            },
            _ => self.reply(requester, "|unknown command"),
        }
        Ok(())
    }

    fn evaluate(&self, requester: &Requester, text: &str) -> crate::config::types::Result<()> {
        let commands = self.holds.batch(requester, text);
        if commands.is_empty() {
            return Ok(());
        }
        let key = self.working.current(requester)?;
        let out = self.out.clone();
        let target = requester.channel.clone().unwrap_or_else(|| requester.user.clone());
        let submitted = self.scheduler.submit(
            commands,
            Some(key),
            Box::new(move |line: &str| {
                out.send(&format!("{} {}", target, line));
            }),
        );
        match submitted {
            // Detached: the session reports through the callback.
            Ok(_ticket) => Ok(()),
            Err(EvalError::CapacityExceeded { .. }) => {
                self.reply(requester, BUSY_LINE);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle(&self, line: &str) {
        let mut parts = line.splitn(3, ' ');
        let (user, channel, text) = match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(channel), Some(text)) if !user.is_empty() => (user, channel, text),
            _ => {
                log::warn!("Ignoring malformed request \"{}\"", escape_control(line));
                return;
            }
        };
        let channel = (channel != "-").then_some(channel);
        let admin = self.admins.iter().any(|a| a.eq_ignore_ascii_case(user));
        let requester = Requester::new(user, channel).with_admin(admin);

        let result = if text.starts_with('!') {
            self.command(&requester, text)
        } else {
            self.evaluate(&requester, text)
        };
        if let Err(e) = result {
            log::info!("Request from {} refused: {}", user, e);
            self.reply(&requester, &format!("|{}", e));
        }
    }
}

fn serve(config: EvalConfig, admins: &[String]) -> Result<()> {
    let throttle = Throttle::start(&config.throttle, io::stdout()).context("starting output throttle")?;
    let frontend = Frontend {
        working: WorkingSessions::new(&config.working)?,
        holds: HoldBuffer::new(&config.working)?,
        scheduler: ExecutionScheduler::new(SessionServices::new(config)?),
        out: throttle.handle(),
        admins: admins.to_vec(),
    };

    log::info!("Serving requests from stdin");
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        frontend.handle(&line);
    }

    // Let running sessions report before the queue is flushed.
    while frontend.scheduler.active_count() > 0 {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    log::info!("Input closed; {} lines dropped by the throttle", throttle.dropped());
    throttle.shutdown();
    Ok(())
}
