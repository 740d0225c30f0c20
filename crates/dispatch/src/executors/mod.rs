use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::DispatchConfig;

pub mod claude;
pub mod codex;

/// A fully-resolved command for one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorCommand {
  pub program: String,
  pub args: Vec<String>,
}

impl ExecutorCommand {
  /// Reject commands an adapter should never have produced.
  pub fn validate(&self, executor_key: &str) -> Result<()> {
    if self.program.trim().is_empty() {
      anyhow::bail!("Executor '{executor_key}' returned an invalid command configuration.");
    }
    Ok(())
  }
}

/// Transforms executor stdout before it reaches the log file (and, for
/// attached runs, the terminal). Returning `None` drops the line.
pub trait OutputFilter: Send {
  fn filter_line(&mut self, line: &str) -> Option<String>;
}

/// Per-AI-tool strategy: builds concrete command lines and knows how to
/// recover the tool's own session identifier. One implementation per
/// supported tool; selected once at run start and threaded through the
/// call chain.
pub trait Executor: Sync {
  fn key(&self) -> &'static str;

  fn build_run_command(
    &self,
    config: &DispatchConfig,
    instructions: Option<&Path>,
    prompt: &str,
  ) -> Result<ExecutorCommand>;

  fn build_resume_command(
    &self,
    config: &DispatchConfig,
    session_id: &str,
    prompt: &str,
  ) -> Result<ExecutorCommand>;

  /// True when the tool writes session files dispatch can discover on disk.
  fn discovers_session_files(&self) -> bool {
    false
  }

  /// Look for a session file created close to `start_time` and return the
  /// identifier encoded in its name.
  fn extract_session_id(
    &self,
    config: &DispatchConfig,
    start_time: DateTime<Utc>,
  ) -> Option<String> {
    let _ = (config, start_time);
    None
  }

  /// Locate the tool's session file for a known identifier, if any.
  fn locate_session_file(&self, config: &DispatchConfig, session_id: &str) -> Option<PathBuf> {
    let _ = (config, session_id);
    None
  }

  fn output_filter(&self) -> Option<Box<dyn OutputFilter>> {
    None
  }

  /// Initial wait before the first extraction attempt.
  fn session_extraction_delay(&self, config: &DispatchConfig, default: Duration) -> Duration {
    let _ = config;
    default
  }
}

pub const EXECUTOR_KEYS: &[&str] = &["claude", "codex"];

/// Resolve an executor by key from the closed set of implementations.
pub fn executor_for(key: &str) -> Result<&'static dyn Executor> {
  match key {
    "claude" => Ok(&claude::ClaudeExecutor),
    "codex" => Ok(&codex::CodexExecutor),
    other => anyhow::bail!(
      "Executor '{other}' not found. Available executors: {}",
      EXECUTOR_KEYS.join(", ")
    ),
  }
}
