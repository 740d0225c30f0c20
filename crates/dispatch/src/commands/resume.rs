use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::AppContext;
use crate::executors::executor_for;
use crate::runner::background;
use crate::runner::execute::{self, SessionTracker};
use crate::session_store::{SessionStatus, SessionStore, truncate_prompt};
use crate::utils::log::t;
use crate::log_info;

pub fn run(
  ctx: &AppContext,
  session_id: &str,
  prompt: &str,
  background_flag: Option<bool>,
) -> Result<()> {
  if prompt.trim().is_empty() {
    anyhow::bail!("Usage: dispatch resume <session-id> \"<prompt>\"");
  }

  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);
  let Some(found) = store.find(session_id).cloned() else {
    return Err(not_found_error(ctx, session_id));
  };

  let executor = executor_for(&found.executor)?;
  let background = background_flag.unwrap_or(found.background);
  let is_runner = background::is_background_runner();

  let start_time = background::derive_start_time();
  let log_file = background::derive_log_file(&ctx.paths, &found.agent, start_time);

  // A resume is a fresh run attempt on an existing session: reset the
  // per-attempt fields before handing the record over.
  let mut record = found;
  record.last_prompt = truncate_prompt(prompt);
  record.last_used = Utc::now();
  record.log_file = log_file.clone();
  record.status = SessionStatus::Starting;
  record.background = background;
  record.runner_pid = is_runner.then(|| std::process::id() as i32);
  record.executor_pid = None;
  record.exit_code = None;
  record.signal = None;
  record.start_time = start_time;
  record.error = None;

  let key = session_id.trim().to_string();
  store.sessions.insert(key.clone(), record.clone());
  store.save(&store_path)?;

  if background && !is_runner {
    let pid = background::launch(&ctx.processes, &ctx.config.background, start_time, &log_file)?;
    if let Some(entry) = store.sessions.get_mut(&key) {
      entry.runner_pid = Some(pid);
      entry.status = SessionStatus::Running;
      entry.last_used = Utc::now();
    }
    store.save(&store_path)?;

    log_info!("Resuming {} in the background", t::id(&key));
    log_info!("  View output:  dispatch view {}", key);
    log_info!("  Stop session: dispatch stop {}", key);
    return Ok(());
  }

  let command = executor.build_resume_command(&ctx.config, &key, prompt)?;
  let tracker = Arc::new(SessionTracker::new(store_path, key, record));
  execute::execute(ctx, executor, &command, tracker, background)?;
  Ok(())
}

/// Distinguish "never existed" from "exists in the executor's private
/// storage but dispatch lost track of it"; the remediation differs.
fn not_found_error(ctx: &AppContext, session_id: &str) -> anyhow::Error {
  let executor = match executor_for(&ctx.config.defaults.executor) {
    Ok(executor) => executor,
    Err(err) => return err,
  };
  if let Some(session_file) = executor.locate_session_file(&ctx.config, session_id) {
    return anyhow::anyhow!(
      "Session '{session_id}' is not tracked in dispatch state.\n\n\
       The raw session file exists at:\n  {}\n\n\
       Tracking for it is missing (the session store may have been deleted or corrupted),\n\
       so it cannot be resumed as-is.\n\n\
       Options:\n\
       \x20 1. Start a new run: dispatch run <agent> \"<prompt>\"\n\
       \x20 2. Restore the session store entry by hand, then resume again",
      session_file.display()
    );
  }
  anyhow::anyhow!("No run found with session id '{session_id}'")
}
