use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;

use crate::config::AppContext;
use crate::executors::{Executor, ExecutorCommand};
use crate::runner::recovery::{self, CancelToken, RetryPolicy};
use crate::session_store::{SessionRecord, SessionStatus, SessionStore};
use crate::utils::log::t;
use crate::{log_error, log_success};

/// Owns one record while its run is in flight.
///
/// Session-identifier updates race with exit handling; both go through the
/// single in-memory record here (last write wins) and each mutation is
/// followed by one consolidated read-modify-write of the store file.
pub struct SessionTracker {
  store_path: PathBuf,
  state: Mutex<TrackerState>,
}

struct TrackerState {
  key: String,
  record: SessionRecord,
}

impl SessionTracker {
  pub fn new(store_path: PathBuf, key: String, record: SessionRecord) -> Self {
    Self {
      store_path,
      state: Mutex::new(TrackerState { key, record }),
    }
  }

  #[must_use]
  pub fn key(&self) -> String {
    self.state.lock().key.clone()
  }

  #[must_use]
  pub fn snapshot(&self) -> SessionRecord {
    self.state.lock().record.clone()
  }

  /// Mutate the record and persist the whole store.
  pub fn update(&self, mutate: impl FnOnce(&mut SessionRecord)) -> Result<()> {
    let mut state = self.state.lock();
    mutate(&mut state.record);
    state.record.last_used = Utc::now();
    let mut store = SessionStore::load(&self.store_path);
    store
      .sessions
      .insert(state.key.clone(), state.record.clone());
    store.save(&self.store_path)
  }

  /// Re-key the record under the executor's own session identifier.
  pub fn adopt_session_id(&self, session_id: &str) -> Result<()> {
    let mut state = self.state.lock();
    if state.key == session_id {
      return Ok(());
    }
    let old_key = std::mem::replace(&mut state.key, session_id.to_string());
    state.record.last_used = Utc::now();
    let mut store = SessionStore::load(&self.store_path);
    store.sessions.remove(&old_key);
    store
      .sessions
      .insert(state.key.clone(), state.record.clone());
    store.save(&self.store_path)
  }
}

#[derive(Debug)]
pub struct RunOutcome {
  pub session_id: String,
  pub status: SessionStatus,
  pub exit_code: Option<i32>,
}

/// Spawn the executor process and own it end to end: wire its output to the
/// log file (and the terminal when attached), watch the stream for the
/// session identifier, drive the recovery schedule, and record the exit.
pub fn execute(
  ctx: &AppContext,
  executor: &'static dyn Executor,
  command: &ExecutorCommand,
  tracker: Arc<SessionTracker>,
  background: bool,
) -> Result<RunOutcome> {
  command.validate(executor.key())?;

  let record = tracker.snapshot();
  let log_file = record.log_file.clone();
  let start_time = record.start_time;
  let agent = record.agent.clone();

  if let Some(dir) = log_file.parent() {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
  }
  let log = OpenOptions::new()
    .create(true)
    .append(true)
    .open(&log_file)
    .with_context(|| format!("failed to open log file {}", log_file.display()))?;
  let log: Arc<Mutex<File>> = Arc::new(Mutex::new(log));

  let mut cmd = Command::new(&command.program);
  cmd
    .args(&command.args)
    .current_dir(ctx.paths.root())
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  let mut child = match cmd.spawn() {
    Ok(child) => child,
    Err(err) => {
      tracker.update(|r| {
        r.status = SessionStatus::Failed;
        r.error = Some(err.to_string());
      })?;
      if background {
        // Recorded for later inspection via `view`; the detached runner
        // has nobody to report to.
        return Ok(RunOutcome {
          session_id: tracker.key(),
          status: SessionStatus::Failed,
          exit_code: None,
        });
      }
      anyhow::bail!("failed to start '{}': {err}", command.program);
    }
  };

  let pid = child.id() as i32;
  tracker.update(|r| {
    r.status = SessionStatus::Running;
    r.executor_pid = Some(pid);
  })?;

  // Session-identifier recovery runs on its own schedule, independent of
  // the process lifetime below.
  let cancel = CancelToken::new();
  if executor.discovers_session_files() {
    let default_delay =
      Duration::from_millis(ctx.config.background.session_extraction_delay_ms);
    let delay = executor.session_extraction_delay(&ctx.config, default_delay);
    let _ = recovery::spawn_session_recovery(
      tracker.clone(),
      executor,
      ctx.config.clone(),
      start_time,
      RetryPolicy::with_initial_delay(delay),
      cancel.clone(),
    );
  }

  let stdout_handle = child.stdout.take().map(|out| {
    let tracker = tracker.clone();
    let log = log.clone();
    let mut filter = executor.output_filter();
    std::thread::spawn(move || {
      let reader = BufReader::new(out);
      for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Some(id) = recovery::session_id_from_line(&line) {
          let _ = tracker.adopt_session_id(&id);
        }
        let rendered = match filter.as_mut() {
          Some(filter) => filter.filter_line(&line),
          None => Some(line.clone()),
        };
        if let Some(text) = rendered {
          {
            let mut log = log.lock();
            let _ = writeln!(log, "{text}");
          }
          if !background {
            anstream::println!("{}", text);
          }
        }
      }
    })
  });

  let stderr_handle = child.stderr.take().map(|err_stream| {
    let log = log.clone();
    std::thread::spawn(move || {
      let reader = BufReader::new(err_stream);
      for line in reader.lines() {
        let Ok(line) = line else { break };
        {
          let mut log = log.lock();
          let _ = writeln!(log, "{line}");
        }
        if !background {
          anstream::eprintln!("{}", line);
        }
      }
    })
  });

  let status = child.wait().context("failed to wait for executor process")?;
  for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
    let _ = handle.join();
  }
  cancel.cancel();

  let exit_code = status.code();
  let signal_name = exit_signal_name(&status);

  // One last cheap read of the log covers executors that only report the
  // identifier at shutdown.
  if let Some(id) = recovery::scan_log_for_session_id(&log_file) {
    let _ = tracker.adopt_session_id(&id);
  }

  let final_status = if exit_code == Some(0) {
    SessionStatus::Completed
  } else {
    SessionStatus::Failed
  };
  tracker.update(|r| {
    r.exit_code = exit_code;
    r.signal = signal_name.clone();
    r.status = final_status;
  })?;

  let session_id = tracker.key();
  if !background {
    let secs = (Utc::now() - start_time).num_seconds();
    match (exit_code, &signal_name) {
      (Some(0), _) => log_success!("{} completed in {}s (session {})", agent, secs, session_id),
      (Some(code), _) => {
        log_error!("{} failed with exit code {} (session {})", agent, code, session_id);
      }
      (None, Some(signal)) => log_error!("{} terminated by {}", agent, signal),
      (None, None) => log_error!("{} exited without a status", agent),
    }
    crate::log_info!("Log: {}", t::path(log_file.display()));
  }

  Ok(RunOutcome {
    session_id,
    status: final_status,
    exit_code,
  })
}

fn exit_signal_name(status: &std::process::ExitStatus) -> Option<String> {
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt as _;
    let raw = status.signal()?;
    match nix::sys::signal::Signal::try_from(raw) {
      Ok(signal) => Some(signal.as_str().to_string()),
      Err(_) => Some(format!("signal {raw}")),
    }
  }
  #[cfg(not(unix))]
  {
    let _ = status;
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{DispatchConfig, DispatchPaths};
  use crate::executors::executor_for;
  use crate::runner::process::{OsProcesses, ProcessRegistry};
  use std::path::Path;

  const SESSION_ID: &str = "0199a213-81c0-7800-8000-1111aaaa2222";

  fn context(root: &Path) -> AppContext {
    AppContext {
      paths: DispatchPaths::new(root),
      config: DispatchConfig::default(),
      processes: Arc::new(ProcessRegistry::new(Arc::new(OsProcesses))),
    }
  }

  fn tracker_for(ctx: &AppContext, key: &str, log_file: PathBuf) -> Arc<SessionTracker> {
    let record = SessionRecord {
      agent: "demo".to_string(),
      mode: "default".to_string(),
      executor: "claude".to_string(),
      log_file,
      last_prompt: "hello".to_string(),
      created: Utc::now(),
      last_used: Utc::now(),
      status: SessionStatus::Starting,
      background: false,
      runner_pid: None,
      executor_pid: None,
      exit_code: None,
      signal: None,
      start_time: Utc::now(),
      error: None,
    };
    let tracker = SessionTracker::new(ctx.paths.sessions_file(), key.to_string(), record);
    tracker
      .update(|_| {})
      .expect("persist starting record");
    Arc::new(tracker)
  }

  fn sh_command(script: &str) -> ExecutorCommand {
    ExecutorCommand {
      program: "/bin/sh".to_string(),
      args: vec!["-c".to_string(), script.to_string()],
    }
  }

  #[test]
  fn successful_run_persists_completed_with_exit_code() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let log_file = ctx.paths.logs_dir().join("demo.log");
    let tracker = tracker_for(&ctx, "placeholder", log_file.clone());

    let outcome = execute(
      &ctx,
      executor_for("claude").unwrap(),
      &sh_command("echo hello-from-agent; exit 0"),
      tracker,
      true,
    )
    .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.exit_code, Some(0));

    let store = SessionStore::load(&ctx.paths.sessions_file());
    let record = store.sessions.get("placeholder").unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.executor_pid.is_some());

    let log = fs::read_to_string(&log_file).unwrap();
    assert!(log.contains("hello-from-agent"));
  }

  #[test]
  fn session_id_in_stream_rekeys_the_record() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let log_file = ctx.paths.logs_dir().join("demo.log");
    let tracker = tracker_for(&ctx, "placeholder", log_file);

    let script = format!(r#"echo '{{"session_id":"{SESSION_ID}"}}'; exit 0"#);
    let outcome = execute(
      &ctx,
      executor_for("claude").unwrap(),
      &sh_command(&script),
      tracker,
      true,
    )
    .unwrap();

    assert_eq!(outcome.session_id, SESSION_ID);
    let store = SessionStore::load(&ctx.paths.sessions_file());
    assert!(store.sessions.contains_key(SESSION_ID));
    assert!(!store.sessions.contains_key("placeholder"));
  }

  #[test]
  fn nonzero_exit_persists_failed_with_code() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let log_file = ctx.paths.logs_dir().join("demo.log");
    let tracker = tracker_for(&ctx, "placeholder", log_file);

    let outcome = execute(
      &ctx,
      executor_for("claude").unwrap(),
      &sh_command("exit 3"),
      tracker,
      true,
    )
    .unwrap();

    assert_eq!(outcome.status, SessionStatus::Failed);
    assert_eq!(outcome.exit_code, Some(3));
    let store = SessionStore::load(&ctx.paths.sessions_file());
    let record = store.sessions.get("placeholder").unwrap();
    assert_eq!(record.status, SessionStatus::Failed);
    assert_eq!(record.exit_code, Some(3));
  }

  #[test]
  fn attached_spawn_failure_is_synchronous_and_recorded() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let log_file = ctx.paths.logs_dir().join("demo.log");
    let tracker = tracker_for(&ctx, "placeholder", log_file);

    let missing = ExecutorCommand {
      program: "/definitely/not/a/binary".to_string(),
      args: vec![],
    };
    let result = execute(
      &ctx,
      executor_for("claude").unwrap(),
      &missing,
      tracker,
      false,
    );
    assert!(result.is_err());

    let store = SessionStore::load(&ctx.paths.sessions_file());
    let record = store.sessions.get("placeholder").unwrap();
    assert_eq!(record.status, SessionStatus::Failed);
    assert!(record.error.as_deref().unwrap_or("").len() > 0);
    // Never spawned, so no executor pid and no exit code
    assert!(record.executor_pid.is_none());
    assert!(record.exit_code.is_none());
  }

  #[test]
  fn background_spawn_failure_is_silent_but_recorded() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let log_file = ctx.paths.logs_dir().join("demo.log");
    let tracker = tracker_for(&ctx, "placeholder", log_file);

    let missing = ExecutorCommand {
      program: "/definitely/not/a/binary".to_string(),
      args: vec![],
    };
    let outcome = execute(
      &ctx,
      executor_for("claude").unwrap(),
      &missing,
      tracker,
      true,
    )
    .unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed);

    let store = SessionStore::load(&ctx.paths.sessions_file());
    assert_eq!(
      store.sessions.get("placeholder").unwrap().status,
      SessionStatus::Failed
    );
  }

  #[test]
  fn tracker_update_keeps_exit_code_and_status_consistent() {
    let temp = tempfile::tempdir().unwrap();
    let ctx = context(temp.path());
    let tracker = tracker_for(&ctx, "k", ctx.paths.logs_dir().join("x.log"));
    tracker
      .update(|r| {
        r.exit_code = Some(0);
        r.status = SessionStatus::Completed;
      })
      .unwrap();

    let store = SessionStore::load(&ctx.paths.sessions_file());
    let record = store.sessions.get("k").unwrap();
    assert!(record.exit_code.is_none() || !record.status.is_active());
  }
}
