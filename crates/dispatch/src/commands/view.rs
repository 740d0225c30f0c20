use std::fs;

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::AppContext;
use crate::runner::status;
use crate::session_store::SessionStore;
use crate::utils::log::t;
use crate::{log_info, log_warn};

pub fn run(ctx: &AppContext, session_id: &str, lines: usize) -> Result<()> {
  let store_path = ctx.paths.sessions_file();
  let mut store = SessionStore::load(&store_path);

  let threshold = Duration::hours(ctx.config.background.abandoned_after_hours as i64);
  if status::sweep(&mut store, ctx.processes.probe(), Utc::now(), threshold) {
    store.save(&store_path)?;
  }

  let Some(record) = store.find(session_id) else {
    anyhow::bail!("No run found with session id '{session_id}'");
  };

  let display = status::resolve_display_status(record, ctx.processes.probe());
  log_info!("Session:    {}", t::id(session_id));
  log_info!("Agent:      {}", t::agent(&record.agent));
  log_info!("Executor:   {}", record.executor);
  log_info!("Mode:       {}", record.mode);
  log_info!("Status:     {}", display.label());
  log_info!("Background: {}", record.background);
  log_info!("Created:    {}", record.created.format("%Y-%m-%d %H:%M:%S"));
  log_info!("Last used:  {}", record.last_used.format("%Y-%m-%d %H:%M:%S"));
  if let Some(pid) = record.executor_pid {
    log_info!("Executor pid: {}", pid);
  }
  if let Some(pid) = record.runner_pid {
    log_info!("Runner pid:   {}", pid);
  }
  if let Some(code) = record.exit_code {
    log_info!("Exit code:  {}", code);
  }
  if let Some(signal) = &record.signal {
    log_info!("Signal:     {}", signal);
  }
  if let Some(error) = &record.error {
    log_info!("Error:      {}", t::err(error));
  }
  if !record.last_prompt.is_empty() {
    log_info!("Prompt:     {}", record.last_prompt);
  }
  log_info!("Log:        {}", t::path(record.log_file.display()));

  match fs::read_to_string(&record.log_file) {
    Ok(content) => {
      let all: Vec<&str> = content.lines().collect();
      let start = all.len().saturating_sub(lines);
      if !all.is_empty() {
        log_info!("");
        for line in &all[start..] {
          log_info!("{}", line);
        }
      }
    }
    Err(_) => {
      log_warn!("Log file not written yet");
    }
  }

  Ok(())
}
