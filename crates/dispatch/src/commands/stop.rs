use anyhow::Result;
use chrono::Utc;

use crate::config::AppContext;
use crate::session_store::{SessionStatus, SessionStore};
use crate::utils::log::t;
use crate::{log_info, log_success, log_warn};

/// Best-effort stop: deliver SIGTERM to whichever of the run's processes
/// are still alive. There is no cooperative protocol with the executor, so
/// the result is recorded as `stopped`, not `completed` or `failed`.
pub fn run(ctx: &AppContext, session_id: &str) -> Result<()> {
  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);

  let Some(record) = store.sessions.get_mut(session_id.trim()) else {
    anyhow::bail!("No session found with id '{session_id}'");
  };

  let probe = ctx.processes.probe();
  let alive: Vec<i32> = [record.runner_pid, record.executor_pid]
    .into_iter()
    .flatten()
    .filter(|pid| probe.is_alive(*pid))
    .collect();

  if alive.is_empty() {
    log_info!("No active process found for {}", t::id(session_id));
    return Ok(());
  }

  for pid in alive {
    if probe.terminate(pid) {
      log_success!("Stopped process {pid}");
    } else {
      log_warn!("Process {pid} was already gone");
    }
  }

  record.status = SessionStatus::Stopped;
  record.signal.get_or_insert_with(|| "SIGTERM".to_string());
  record.last_used = Utc::now();
  store.save(&store_path)?;

  log_success!("Stop signal handled for {session_id}");
  Ok(())
}
