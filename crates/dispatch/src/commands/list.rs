use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::AppContext;
use crate::log_info;
use crate::runner::status;
use crate::session_store::SessionStore;
use crate::utils::term::print_table;

pub fn run(ctx: &AppContext) -> Result<()> {
  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);

  let threshold = Duration::hours(ctx.config.background.abandoned_after_hours as i64);
  if status::sweep(&mut store, ctx.processes.probe(), Utc::now(), threshold) {
    store.save(&store_path)?;
  }

  if store.sessions.is_empty() {
    log_info!("No sessions tracked yet. Start one with `dispatch run <agent> \"<prompt>\"`.");
    return Ok(());
  }

  let mut entries: Vec<_> = store.sessions.into_iter().collect();
  entries.sort_by(|a, b| b.1.last_used.cmp(&a.1.last_used));

  let rows: Vec<Vec<String>> = entries
    .iter()
    .map(|(id, record)| {
      let display = status::resolve_display_status(record, ctx.processes.probe());
      vec![
        id.clone(),
        record.agent.clone(),
        display.label(),
        record.mode.clone(),
        record.created.format("%Y-%m-%d %H:%M").to_string(),
        record.last_used.format("%Y-%m-%d %H:%M").to_string(),
      ]
    })
    .collect();

  print_table(
    &["SESSION", "AGENT", "STATUS", "MODE", "CREATED", "LAST USED"],
    &rows,
  );
  Ok(())
}
