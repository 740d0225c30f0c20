use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::config::{BackgroundConfig, DispatchPaths};
use crate::runner::process::{ChildMeta, ProcessRegistry};

/// Environment markers coordinating the two-generation background spawn.
/// They must survive a process re-exec unchanged; nothing else reads them.
pub const RUNNER_ENV: &str = "DISPATCH_BACKGROUND_RUNNER";
pub const START_TIME_ENV: &str = "DISPATCH_START_TIME";
pub const LOG_FILE_ENV: &str = "DISPATCH_LOG_FILE";

/// True when this process is the detached runner generation.
#[must_use]
pub fn is_background_runner() -> bool {
  std::env::var(RUNNER_ENV).ok().as_deref() == Some("1")
}

/// Start time for the current run: the marker when re-executed, now otherwise.
#[must_use]
pub fn derive_start_time() -> DateTime<Utc> {
  if let Ok(raw) = std::env::var(START_TIME_ENV)
    && let Ok(ms) = raw.parse::<i64>()
    && let Some(time) = Utc.timestamp_millis_opt(ms).single()
  {
    return time;
  }
  Utc::now()
}

/// Log file for the current run. The marker wins so both generations of a
/// background run agree on one file; otherwise the name is derived from the
/// agent and start time.
#[must_use]
pub fn derive_log_file(paths: &DispatchPaths, agent: &str, start_time: DateTime<Utc>) -> PathBuf {
  if let Ok(path) = std::env::var(LOG_FILE_ENV)
    && !path.trim().is_empty()
  {
    return PathBuf::from(path);
  }
  let filename = format!(
    "{}-{}.log",
    sanitize_log_filename(agent),
    start_time.timestamp_millis()
  );
  paths.logs_dir().join(filename)
}

/// Reduce an agent name to a safe log filename stem.
#[must_use]
pub fn sanitize_log_filename(agent: &str) -> String {
  let fallback = "agent";
  let mut out = String::with_capacity(agent.len());
  let mut last_dash = false;
  for ch in agent.trim().chars() {
    let mapped = match ch {
      'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' => Some(ch),
      _ => None,
    };
    match mapped {
      Some(c) => {
        out.push(c);
        last_dash = false;
      }
      None => {
        if !last_dash && !out.is_empty() {
          out.push('-');
          last_dash = true;
        }
      }
    }
  }
  let trimmed = out.trim_matches(['-', '.']).to_string();
  if trimmed.is_empty() {
    fallback.to_string()
  } else {
    trimmed
  }
}

/// Re-invoke the whole original command line as a detached child.
///
/// The child carries the three markers so it recovers the same start time
/// and log file instead of inventing new ones, and runs with no controlling
/// terminal and discarded standard streams so it outlives this invocation.
/// Returns the child's pid, which the caller persists as `runnerPid`.
pub fn launch(
  registry: &ProcessRegistry,
  background: &BackgroundConfig,
  start_time: DateTime<Utc>,
  log_file: &PathBuf,
) -> Result<i32> {
  if !background.enabled {
    anyhow::bail!("Background execution is disabled in configuration.");
  }

  let exe = std::env::current_exe().context("failed to get current exe")?;
  let raw_args: Vec<String> = std::env::args().skip(1).collect();

  let mut cmd = Command::new(exe);
  cmd.args(&raw_args);
  cmd.env(RUNNER_ENV, "1");
  cmd.env(START_TIME_ENV, start_time.timestamp_millis().to_string());
  cmd.env(LOG_FILE_ENV, log_file);
  cmd.stdin(Stdio::null());
  cmd.stdout(Stdio::null());
  cmd.stderr(Stdio::null());
  #[cfg(unix)]
  {
    use std::os::unix::process::CommandExt as _;
    cmd.process_group(0);
  }

  let child = cmd.spawn().context("failed to spawn background runner")?;
  let pid = child.id() as i32;
  registry.register(ChildMeta {
    pid,
    raw_args,
    log_file: log_file.clone(),
    detached: true,
    launched_at: Utc::now(),
  });
  Ok(pid)
}
