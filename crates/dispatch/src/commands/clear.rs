use anyhow::Result;

use crate::config::AppContext;
use crate::session_store::SessionStore;
use crate::utils::log::t;
use crate::{log_info, log_success};

/// Drop every tracked session for an agent. Log files stay on disk.
pub fn run(ctx: &AppContext, agent: &str) -> Result<()> {
  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);

  let before = store.sessions.len();
  store.sessions.retain(|_, record| record.agent != agent);
  let removed = before - store.sessions.len();

  if removed == 0 {
    log_info!("No sessions tracked for agent {}", t::agent(agent));
    return Ok(());
  }

  store.save(&store_path)?;
  log_success!("Cleared {removed} session(s) for {agent}");
  Ok(())
}
