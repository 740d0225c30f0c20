use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::config::DispatchConfig;
use crate::executors::{Executor, ExecutorCommand};

fn uuid_in_name() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(?i)([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
      .expect("valid uuid regex")
  })
}

/// Adapter for the `codex` CLI.
///
/// Codex never prints its session identifier; it writes a
/// `rollout-<stamp>-<uuid>.jsonl` file under a per-day directory of its
/// private sessions dir. Recovery matches a freshly created file against
/// the run's start time and pulls the identifier out of the filename.
pub struct CodexExecutor;

impl Executor for CodexExecutor {
  fn key(&self) -> &'static str {
    "codex"
  }

  fn build_run_command(
    &self,
    config: &DispatchConfig,
    instructions: Option<&Path>,
    prompt: &str,
  ) -> Result<ExecutorCommand> {
    let cfg = &config.executors.codex;
    let mut args: Vec<String> = vec!["exec".to_string()];

    if cfg.full_auto {
      args.push("--full-auto".to_string());
    }
    if let Some(model) = &cfg.model {
      args.push("-m".to_string());
      args.push(model.clone());
    }
    if let Some(sandbox) = &cfg.sandbox {
      args.push("-s".to_string());
      args.push(sandbox.clone());
    }
    args.extend(cfg.additional_args.iter().cloned());

    if let Some(path) = instructions {
      args.push("-c".to_string());
      args.push(format!(
        "append_user_instructions_file=\"{}\"",
        path.display()
      ));
    }

    args.push(prompt.to_string());

    Ok(ExecutorCommand {
      program: cfg.binary.clone(),
      args,
    })
  }

  fn build_resume_command(
    &self,
    config: &DispatchConfig,
    session_id: &str,
    prompt: &str,
  ) -> Result<ExecutorCommand> {
    let cfg = &config.executors.codex;
    let mut args: Vec<String> = vec!["exec".to_string(), "resume".to_string()];
    args.extend(cfg.additional_args.iter().cloned());
    args.push(session_id.to_string());
    args.push(prompt.to_string());
    Ok(ExecutorCommand {
      program: cfg.binary.clone(),
      args,
    })
  }

  fn discovers_session_files(&self) -> bool {
    true
  }

  fn extract_session_id(
    &self,
    config: &DispatchConfig,
    start_time: DateTime<Utc>,
  ) -> Option<String> {
    let sessions_dir = config.executors.codex.resolved_sessions_dir()?;
    let day_dir = day_dir(&sessions_dir, start_time);
    let window_ms = i64::try_from(config.background.session_match_window_secs)
      .ok()?
      .saturating_mul(1000);

    let mut files = rollout_files(&day_dir);
    // Newest first, so the most recent matching run wins
    files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, mtime) in files {
      if (mtime - start_time).num_milliseconds().abs() <= window_ms {
        let name = path.file_name()?.to_string_lossy().to_string();
        if let Some(found) = uuid_in_name().find(&name) {
          return Some(found.as_str().to_string());
        }
      }
    }
    None
  }

  fn locate_session_file(&self, config: &DispatchConfig, session_id: &str) -> Option<PathBuf> {
    let sessions_dir = config.executors.codex.resolved_sessions_dir()?;
    let needle = session_id.to_lowercase();

    // Walk the year/month/day tree; it stays shallow by construction.
    for year in read_dirs(&sessions_dir) {
      for month in read_dirs(&year) {
        for day in read_dirs(&month) {
          for (path, _) in rollout_files(&day) {
            let name = path.file_name()?.to_string_lossy().to_lowercase();
            if name.contains(&needle) {
              return Some(path);
            }
          }
        }
      }
    }
    None
  }

  fn session_extraction_delay(&self, config: &DispatchConfig, default: Duration) -> Duration {
    config
      .executors
      .codex
      .session_extraction_delay_ms
      .map_or(default, Duration::from_millis)
  }
}

fn day_dir(sessions_dir: &Path, start_time: DateTime<Utc>) -> PathBuf {
  let local = start_time.with_timezone(&Local);
  sessions_dir
    .join(format!("{:04}", local.year()))
    .join(format!("{:02}", local.month()))
    .join(format!("{:02}", local.day()))
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
  let Ok(entries) = fs::read_dir(dir) else {
    return Vec::new();
  };
  entries
    .flatten()
    .map(|e| e.path())
    .filter(|p| p.is_dir())
    .collect()
}

fn rollout_files(dir: &Path) -> Vec<(PathBuf, DateTime<Utc>)> {
  let Ok(entries) = fs::read_dir(dir) else {
    return Vec::new();
  };
  entries
    .flatten()
    .filter_map(|entry| {
      let path = entry.path();
      let name = path.file_name()?.to_string_lossy().to_string();
      if !name.starts_with("rollout-") || !name.ends_with(".jsonl") {
        return None;
      }
      let mtime = entry.metadata().ok()?.modified().ok()?;
      Some((path, DateTime::<Utc>::from(mtime)))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DispatchConfig;

  const SESSION_ID: &str = "0199a213-81c0-7800-8000-1111aaaa2222";

  fn config_with_sessions_dir(dir: &Path) -> DispatchConfig {
    let mut cfg = DispatchConfig::default();
    cfg.executors.codex.sessions_dir = Some(dir.to_path_buf());
    cfg
  }

  fn write_rollout(sessions_dir: &Path, at: DateTime<Utc>, id: &str) -> PathBuf {
    let dir = day_dir(sessions_dir, at);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("rollout-2026-08-07T10-00-00-{id}.jsonl"));
    fs::write(&path, "{}\n").unwrap();
    path
  }

  #[test]
  fn run_command_includes_exec_options() {
    let mut cfg = DispatchConfig::default();
    cfg.executors.codex.full_auto = true;
    cfg.executors.codex.model = Some("gpt-5-codex".to_string());
    cfg.executors.codex.sandbox = Some("workspace-write".to_string());
    cfg.executors.codex.additional_args = vec!["--skip-git-repo-check".to_string()];

    let cmd = CodexExecutor.build_run_command(&cfg, None, "do it").unwrap();
    assert_eq!(cmd.program, "codex");
    assert_eq!(
      cmd.args,
      vec![
        "exec",
        "--full-auto",
        "-m",
        "gpt-5-codex",
        "-s",
        "workspace-write",
        "--skip-git-repo-check",
        "do it"
      ]
    );
  }

  #[test]
  fn resume_command_appends_session_and_prompt() {
    let cfg = DispatchConfig::default();
    let cmd = CodexExecutor
      .build_resume_command(&cfg, SESSION_ID, "keep going")
      .unwrap();
    assert_eq!(cmd.args[0], "exec");
    assert_eq!(cmd.args[1], "resume");
    assert_eq!(cmd.args[2], SESSION_ID);
    assert_eq!(cmd.args[3], "keep going");
  }

  #[test]
  fn extracts_session_id_from_fresh_rollout_file() {
    let temp = tempfile::tempdir().unwrap();
    let start = Utc::now();
    write_rollout(temp.path(), start, SESSION_ID);

    let cfg = config_with_sessions_dir(temp.path());
    let found = CodexExecutor.extract_session_id(&cfg, start);
    assert_eq!(found.as_deref(), Some(SESSION_ID));
  }

  #[test]
  fn extraction_ignores_files_outside_the_window() {
    let temp = tempfile::tempdir().unwrap();
    let start = Utc::now();
    write_rollout(temp.path(), start, SESSION_ID);

    let mut cfg = config_with_sessions_dir(temp.path());
    cfg.background.session_match_window_secs = 0;
    // File mtime is "now" but the run started two minutes ago
    let stale_start = start - chrono::Duration::minutes(2);
    assert!(CodexExecutor.extract_session_id(&cfg, stale_start).is_none());
  }

  #[test]
  fn extraction_handles_missing_day_dir() {
    let temp = tempfile::tempdir().unwrap();
    let cfg = config_with_sessions_dir(temp.path());
    assert!(CodexExecutor.extract_session_id(&cfg, Utc::now()).is_none());
  }

  #[test]
  fn locates_session_file_by_id() {
    let temp = tempfile::tempdir().unwrap();
    let path = write_rollout(temp.path(), Utc::now(), SESSION_ID);

    let cfg = config_with_sessions_dir(temp.path());
    let found = CodexExecutor.locate_session_file(&cfg, SESSION_ID);
    assert_eq!(found, Some(path));
    assert!(
      CodexExecutor
        .locate_session_file(&cfg, "ffffffff-0000-0000-0000-000000000000")
        .is_none()
    );
  }
}
