//! Integration tests for interpreter sessions
//!
//! These drive the scripted interpreter binary through real processes and
//! sockets.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evalrelay::config::types::{AbortReason, EvalConfig, EvalError, Rendezvous, Result};
use evalrelay::identity::key::SessionKey;
use evalrelay::scheduler::ExecutionScheduler;
use evalrelay::session::callback::QueryService;
use evalrelay::session::interpreter::{InterpreterSession, SessionOutcome, SessionPhase, SessionServices};

fn mock_config() -> EvalConfig {
    let mut config = EvalConfig::default();
    config.interpreter.command = vec![
        env!("CARGO_BIN_EXE_evalrelay-mock-interp").to_string(),
        "-jfd".to_string(),
    ];
    config.interpreter.memory_limit = None;
    config.interpreter.timeout_ms = 5_000;
    config.interpreter.kill_grace_ms = 200;
    config.sessions.dumper = "dump".to_string();
    config.sessions.loader = "load".to_string();
    config.output.max_lines = 3;
    config.output.width = 20;
    config
}

fn services(config: EvalConfig) -> SessionServices {
    SessionServices::new(config).unwrap()
}

fn run(services: &SessionServices, commands: &[&str], key: Option<&str>) -> (SessionOutcome, Vec<String>) {
    let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
    let key = key.map(|k| SessionKey::parse(k).unwrap());
    let mut lines = Vec::new();
    let outcome = InterpreterSession::new(services, key).run(&commands, &mut |line: &str| lines.push(line.to_string()));
    (outcome, lines)
}

#[test]
fn test_output_capped_per_command() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["echo 5", "echo 2"], None);

    assert_eq!(outcome.phase, SessionPhase::Done);
    assert_eq!(lines, vec!["line 1", "line 2", "line 3", "line 1", "line 2"]);
    assert_eq!(outcome.lines_dropped, 2);
    assert_eq!(outcome.lines_emitted, 5);
}

#[test]
fn test_lines_blanked_and_truncated() {
    let services = services(mock_config());
    let (_, lines) = run(&services, &["say ab\tcd\x07efghijklmnopqrstuvwxyz"], None);
    assert_eq!(lines, vec!["ab cd efghijklmnopqr"]);
    assert_eq!(lines[0].chars().count(), 20);
}

#[test]
fn test_silent_request_reports_ok() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["1+1", "fail"], None);
    assert_eq!(outcome.phase, SessionPhase::Done);
    assert_eq!(lines, vec!["|ok"]);
}

#[test]
fn test_timeout_emits_single_diagnostic() {
    let mut config = mock_config();
    config.interpreter.timeout_ms = 1_000;
    let services = services(config);

    let started = Instant::now();
    let (outcome, lines) = run(&services, &["echo 1", "sleep 10000"], None);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(lines, vec!["line 1", "|timeout"]);
    assert_eq!(outcome.abort, Some(AbortReason::Timeout));
    assert!(matches!(outcome.error(), Some(EvalError::Timeout)));
}

#[test]
fn test_competing_aborts_report_once() {
    let mut config = mock_config();
    config.interpreter.timeout_ms = 300;
    let services = services(config);
    for _ in 0..3 {
        // the watchdog and the exiting child race each other
        let (outcome, lines) = run(&services, &["sleep 300", "exit"], None);
        assert_eq!(lines.len(), 1, "{:?}", lines);
        assert!(lines[0].starts_with('|'));
        assert!(outcome.is_aborted());
    }
}

#[test]
fn test_child_exit_aborts() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["echo 1", "exit", "echo 1"], None);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "line 1");
    assert!(
        lines[1] == "|child exited" || lines[1] == "|connection closed",
        "{:?}",
        lines
    );
    assert!(matches!(outcome.error(), Some(EvalError::ChildExited)));
}

#[test]
fn test_state_survives_between_sessions() {
    let services = services(mock_config());

    let (first, lines) = run(&services, &["put hello", "put world"], Some("alice,p"));
    assert_eq!(lines, vec!["|ok"]);
    assert!(first.state_saved);
    assert!(!first.state_restored);

    let (second, lines) = run(&services, &["show"], Some("ALICE,p"));
    assert!(second.state_restored);
    assert_eq!(lines, vec!["hello", "world"]);

    // a different key starts fresh
    let (_, lines) = run(&services, &["show"], Some("alice,q"));
    assert_eq!(lines, vec!["(empty)"]);
    assert_eq!(services.states.len(), 2);
}

#[test]
fn test_oversized_state_keeps_previous() {
    let mut config = mock_config();
    config.sessions.max_state_bytes = 100;
    let services = services(config);
    let key = SessionKey::parse("bob,p").unwrap();

    run(&services, &["put small"], Some("bob,p"));
    assert_eq!(services.states.get(&key), Some(b"small\n".to_vec()));

    let (outcome, lines) = run(&services, &["big 500"], Some("bob,p"));
    assert_eq!(lines, vec!["|ok", "|state size error"]);
    assert_eq!(outcome.abort, Some(AbortReason::StateTooLarge));
    assert!(!outcome.state_saved);
    assert_eq!(services.states.get(&key), Some(b"small\n".to_vec()));
}

#[test]
fn test_state_must_stay_below_limit() {
    let mut config = mock_config();
    config.sessions.max_state_bytes = 100;
    let services = services(config);
    let key = SessionKey::parse("erin,p").unwrap();

    let (outcome, _) = run(&services, &["big 99"], Some("erin,p"));
    assert!(outcome.state_saved);
    assert_eq!(services.states.get(&key).map(|s| s.len()), Some(99));

    let (outcome, lines) = run(&services, &["big 100"], Some("erin,p"));
    assert_eq!(outcome.abort, Some(AbortReason::StateTooLarge));
    assert_eq!(lines.last().map(String::as_str), Some("|state size error"));
    assert_eq!(services.states.get(&key).map(|s| s.len()), Some(99));
}

#[test]
fn test_failing_loader_aborts() {
    let mut config = mock_config();
    config.sessions.loader = "fail".to_string();
    let services = services(config);

    run(&services, &["put x"], Some("carol,p"));
    let (outcome, lines) = run(&services, &["show"], Some("carol,p"));
    assert_eq!(lines, vec!["|protocol error: state loader failed"]);
    assert!(matches!(outcome.abort, Some(AbortReason::ProtocolViolation(_))));
}

#[test]
fn test_continuation_lines() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["ask", "more"], None);
    assert_eq!(outcome.phase, SessionPhase::Done);
    assert_eq!(lines, vec!["got more"]);

    let (outcome, lines) = run(&services, &["ask"], None);
    assert_eq!(lines, vec!["|need input"]);
    assert_eq!(outcome.abort, Some(AbortReason::NeedInput));
}

#[test]
fn test_text_callback_round_trip() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["wd hi there"], None);
    assert_eq!(outcome.phase, SessionPhase::Done);
    assert_eq!(lines, vec!["wd hi there"]);
}

#[test]
fn test_rejected_callbacks() {
    let services = services(mock_config());
    let (_, lines) = run(&services, &["wdq what"], None);
    assert_eq!(lines, vec!["|disabled wd1"]);
    let (_, lines) = run(&services, &["wdx"], None);
    assert_eq!(lines, vec!["|invalid wd"]);
}

struct Shouter;

impl QueryService for Shouter {
    fn query(&self, text: &str) -> Result<String> {
        Ok(text.to_uppercase())
    }
}

#[test]
fn test_query_callback_uses_service() {
    let mut config = mock_config();
    config.callbacks.queries_enabled = true;
    config.output.width = 80;
    let services = services(config).with_query_service(Arc::new(Shouter));
    let (_, lines) = run(&services, &["wdq abc"], None);
    assert_eq!(lines, vec!["wdq 0 ABC"]);
}

#[test]
fn test_out_of_place_reply_is_violation() {
    let services = services(mock_config());
    let (outcome, lines) = run(&services, &["echo 1", "bogus"], None);
    assert_eq!(lines, vec!["line 1", "|protocol error: unexpected variable reply"]);
    assert!(matches!(outcome.error(), Some(EvalError::ProtocolViolation(_))));
}

#[test]
fn test_loopback_rendezvous() {
    let mut config = mock_config();
    config.interpreter.rendezvous = Rendezvous::Loopback;
    config.interpreter.command[1] = "-jconnect".to_string();
    let services = services(config);
    let (outcome, lines) = run(&services, &["echo 2"], None);
    assert_eq!(outcome.phase, SessionPhase::Done);
    assert_eq!(lines, vec!["line 1", "line 2"]);
}

#[test]
fn test_missing_interpreter_reports_spawn_failure() {
    let mut config = mock_config();
    config.interpreter.command = vec!["/nonexistent/interp".to_string(), "-jfd".to_string()];
    let services = services(config);
    let (outcome, lines) = run(&services, &["echo 1"], None);
    assert_eq!(lines, vec!["|spawn failed"]);
    assert_eq!(outcome.abort, Some(AbortReason::SpawnFailed));
}

#[test]
fn test_scheduler_backpressure() {
    let mut config = mock_config();
    config.scheduler.max_parallel = 2;
    let scheduler = ExecutionScheduler::new(services(config));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let tickets: Vec<_> = (0..2)
        .map(|_| {
            let seen = Arc::clone(&seen);
            scheduler
                .submit(
                    vec!["sleep 500".to_string()],
                    None,
                    Box::new(move |line: &str| seen.lock().unwrap().push(line.to_string())),
                )
                .unwrap()
        })
        .collect();

    let rejected = scheduler.submit(vec!["echo 1".to_string()], None, Box::new(|_: &str| {}));
    assert!(matches!(rejected, Err(EvalError::CapacityExceeded { active: 2, limit: 2 })));
    assert_eq!(scheduler.active().len(), 2);

    for ticket in tickets {
        let outcome = ticket.wait().unwrap();
        assert_eq!(outcome.phase, SessionPhase::Done);
    }
    assert_eq!(*seen.lock().unwrap(), vec!["|ok", "|ok"]);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn test_scheduler_session_cache_operations() {
    let scheduler = ExecutionScheduler::new(services(mock_config()));
    let key = SessionKey::parse("dave,p").unwrap();
    let copy = SessionKey::parse("dave,q").unwrap();

    let ticket = scheduler
        .submit(vec!["put kept".to_string()], Some(key.clone()), Box::new(|_: &str| {}))
        .unwrap();
    assert!(ticket.wait().unwrap().state_saved);

    assert!(scheduler.copy_session(&copy, &key));
    assert_eq!(scheduler.list_sessions(), vec![key.clone(), copy.clone()]);

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let ticket = scheduler
        .submit(
            vec!["show".to_string()],
            Some(copy.clone()),
            Box::new(move |line: &str| sink.lock().unwrap().push(line.to_string())),
        )
        .unwrap();
    ticket.wait().unwrap();
    assert_eq!(*lines.lock().unwrap(), vec!["kept"]);

    assert!(scheduler.clear_session(&key));
    assert_eq!(scheduler.list_sessions(), vec![copy]);
}
