mod common;

use crate::common::test_env::TestEnv;
use anyhow::Result;
use chrono::Utc;
use dispatch::session_store::{SessionRecord, SessionStatus, SessionStore};
use predicates::prelude::*;

fn record_with_pids(runner_pid: Option<i32>, executor_pid: Option<i32>) -> SessionRecord {
  let now = Utc::now();
  SessionRecord {
    agent: "demo".to_string(),
    mode: "default".to_string(),
    executor: "claude".to_string(),
    log_file: "/tmp/stop-test.log".into(),
    last_prompt: "long running".to_string(),
    created: now,
    last_used: now,
    status: SessionStatus::Running,
    background: runner_pid.is_some(),
    runner_pid,
    executor_pid,
    exit_code: None,
    signal: None,
    start_time: now,
    error: None,
  }
}

#[test]
fn stop_unknown_session_fails() -> Result<()> {
  let env = TestEnv::new();
  env
    .dispatch()?
    .args(["stop", "nope"])
    .assert()
    .failure()
    .stderr(predicates::str::contains("No session found with id 'nope'").from_utf8());
  Ok(())
}

#[test]
fn stop_with_no_live_processes_reports_and_leaves_status() -> Result<()> {
  let env = TestEnv::new();
  let mut store = SessionStore::default();
  store
    .sessions
    .insert("dead".to_string(), record_with_pids(None, None));
  store.save(&env.store_path())?;

  env
    .dispatch()?
    .args(["stop", "dead"])
    .assert()
    .success()
    .stdout(predicates::str::contains("No active process found").from_utf8());

  let store = env.load_store();
  assert_eq!(
    store.sessions.get("dead").unwrap().status,
    SessionStatus::Running
  );
  Ok(())
}

#[test]
fn stop_signals_live_runner_even_when_executor_is_gone() -> Result<()> {
  let env = TestEnv::new();

  // A live process stands in for the detached runner; the executor pid is
  // far beyond pid_max and therefore dead.
  let mut runner = std::process::Command::new("sleep").arg("60").spawn()?;
  let mut store = SessionStore::default();
  store.sessions.insert(
    "half-dead".to_string(),
    record_with_pids(Some(runner.id() as i32), Some(99_999_999)),
  );
  store.save(&env.store_path())?;

  env
    .dispatch()?
    .args(["stop", "half-dead"])
    .assert()
    .success()
    .stdout(predicates::str::contains("Stop signal handled for half-dead").from_utf8());

  let store = env.load_store();
  let record = store.sessions.get("half-dead").unwrap();
  assert_eq!(record.status, SessionStatus::Stopped);
  assert_eq!(record.signal.as_deref(), Some("SIGTERM"));
  assert!(record.exit_code.is_none());

  let _ = runner.kill();
  let _ = runner.wait();
  Ok(())
}

#[test]
fn stopped_background_run_is_recorded_as_stopped() -> Result<()> {
  let env = TestEnv::new();
  env.write_stub(
    "fake-agent",
    "#!/bin/sh\nexec sleep 30\n",
  )?;

  env
    .dispatch()?
    .args(["run", "demo", "sleepy", "--background"])
    .assert()
    .success();

  let store = env.load_store();
  let (id, record) = store.sessions.iter().next().unwrap();
  assert_eq!(record.status, SessionStatus::Running);

  env
    .dispatch()?
    .args(["stop", id])
    .assert()
    .success()
    .stdout(predicates::str::contains("Stop signal handled").from_utf8());

  let store = env.load_store();
  let (_, record) = store.sessions.iter().next().unwrap();
  assert_eq!(record.status, SessionStatus::Stopped);
  Ok(())
}
