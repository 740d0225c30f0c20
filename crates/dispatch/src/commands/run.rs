use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::config::AppContext;
use crate::executors::executor_for;
use crate::runner::background;
use crate::runner::execute::{self, SessionTracker};
use crate::session_store::{SessionRecord, SessionStatus, SessionStore, truncate_prompt};
use crate::utils::log::t;
use crate::log_info;

#[derive(Debug, Default)]
pub struct RunOptions {
  /// Tri-state: explicit --background / --no-background, or unset.
  pub background: Option<bool>,
  pub executor: Option<String>,
  pub mode: Option<String>,
}

pub fn run(ctx: &AppContext, agent_name: &str, prompt: &str, opts: &RunOptions) -> Result<()> {
  if prompt.trim().is_empty() {
    anyhow::bail!("Usage: dispatch run <agent> \"<prompt>\"");
  }
  let agent = ctx.config.get_agent(agent_name)?;

  let mode = opts
    .mode
    .clone()
    .or_else(|| agent.mode.clone())
    .unwrap_or_else(|| ctx.config.defaults.mode.clone());
  let executor_key = opts
    .executor
    .clone()
    .or_else(|| agent.executor.clone())
    .unwrap_or_else(|| ctx.config.defaults.executor.clone());
  let executor = executor_for(&executor_key)?;
  let background = opts.background.or(agent.background).unwrap_or(false);
  let is_runner = background::is_background_runner();

  let start_time = background::derive_start_time();
  let log_file = background::derive_log_file(&ctx.paths, agent_name, start_time);
  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);

  // The runner generation adopts the record its launcher persisted; both
  // generations agree on the log file, which is what identifies it.
  let (key, record) = match store.find_by_log_file(&log_file) {
    Some((key, existing)) if is_runner => {
      let mut record = existing.clone();
      record.runner_pid = Some(std::process::id() as i32);
      record.background = true;
      (key.clone(), record)
    }
    _ => {
      let now = Utc::now();
      let record = SessionRecord {
        agent: agent_name.to_string(),
        mode,
        executor: executor_key.clone(),
        log_file: log_file.clone(),
        last_prompt: truncate_prompt(prompt),
        created: now,
        last_used: now,
        status: SessionStatus::Starting,
        background,
        runner_pid: is_runner.then(|| std::process::id() as i32),
        executor_pid: None,
        exit_code: None,
        signal: None,
        start_time,
        error: None,
      };
      (Uuid::new_v4().to_string(), record)
    }
  };
  store.sessions.insert(key.clone(), record.clone());
  store.save(&store_path)?;

  if background && !is_runner {
    let pid = background::launch(&ctx.processes, &ctx.config.background, start_time, &log_file)?;
    debug!("spawned detached runner {pid} for session {key}");
    if let Some(entry) = store.sessions.get_mut(&key) {
      entry.runner_pid = Some(pid);
      entry.status = SessionStatus::Running;
      entry.last_used = Utc::now();
    }
    store.save(&store_path)?;

    log_info!("Launching {} in the background", t::agent(agent_name));
    log_info!("Session: {}", t::id(&key));
    log_info!("");
    log_info!("  View output:            dispatch view {}", key);
    log_info!("  Continue conversation:  dispatch resume {} \"<message>\"", key);
    log_info!("  Stop session:           dispatch stop {}", key);
    return Ok(());
  }

  let command = executor.build_run_command(&ctx.config, agent.instructions.as_deref(), prompt)?;
  let tracker = Arc::new(SessionTracker::new(store_path, key, record));
  execute::execute(ctx, executor, &command, tracker, background)?;
  Ok(())
}
