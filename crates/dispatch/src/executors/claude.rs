use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::DispatchConfig;
use crate::executors::{Executor, ExecutorCommand, OutputFilter};

/// Adapter for the `claude` CLI.
///
/// Claude reports its session identifier inside the stream-json output
/// rather than through a discoverable session directory, so this adapter
/// relies on the mid-stream watcher and supplies an output filter that
/// renders the event stream into readable log lines.
pub struct ClaudeExecutor;

impl Executor for ClaudeExecutor {
  fn key(&self) -> &'static str {
    "claude"
  }

  fn build_run_command(
    &self,
    config: &DispatchConfig,
    instructions: Option<&Path>,
    prompt: &str,
  ) -> Result<ExecutorCommand> {
    let cfg = &config.executors.claude;
    let mut args: Vec<String> = vec![
      "-p".to_string(),
      "--verbose".to_string(),
      "--output-format".to_string(),
      "stream-json".to_string(),
    ];

    if let Some(model) = &cfg.model {
      args.push("--model".to_string());
      args.push(model.clone());
    }

    if let Some(mode) = &cfg.permission_mode
      && mode != "default"
    {
      args.push("--permission-mode".to_string());
      args.push(mode.clone());
    }

    if !cfg.allowed_tools.is_empty() {
      args.push("--allowed-tools".to_string());
      args.push(cfg.allowed_tools.join(","));
    }

    if !cfg.disallowed_tools.is_empty() {
      args.push("--disallowed-tools".to_string());
      args.push(cfg.disallowed_tools.join(","));
    }

    if let Some(path) = instructions {
      let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read instructions file {}", path.display()))?;
      args.push("--append-system-prompt".to_string());
      args.push(content);
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
    let cfg = &config.executors.claude;
    let args: Vec<String> = vec![
      "-p".to_string(),
      "--verbose".to_string(),
      "--output-format".to_string(),
      "stream-json".to_string(),
      "--resume".to_string(),
      session_id.to_string(),
      prompt.to_string(),
    ];
    Ok(ExecutorCommand {
      program: cfg.binary.clone(),
      args,
    })
  }

  fn output_filter(&self) -> Option<Box<dyn OutputFilter>> {
    Some(Box::new(StreamJsonFilter))
  }

  fn session_extraction_delay(&self, config: &DispatchConfig, default: Duration) -> Duration {
    config
      .executors
      .claude
      .session_extraction_delay_ms
      .map_or(default, Duration::from_millis)
  }
}

/// Renders claude's stream-json events into plain log lines.
/// Lines that are not recognized events pass through untouched.
struct StreamJsonFilter;

impl OutputFilter for StreamJsonFilter {
  fn filter_line(&mut self, line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
      return Some(line.to_string());
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
      return Some(line.to_string());
    };
    match value.get("type").and_then(serde_json::Value::as_str) {
      Some("system") => {
        let session = value
          .get("session_id")
          .and_then(serde_json::Value::as_str)
          .unwrap_or("unknown");
        Some(format!("[system] session {session}"))
      }
      Some("assistant") => {
        let text = assistant_text(&value);
        if text.is_empty() {
          None
        } else {
          Some(text)
        }
      }
      Some("result") => {
        let subtype = value
          .get("subtype")
          .and_then(serde_json::Value::as_str)
          .unwrap_or("done");
        Some(format!("[result] {subtype}"))
      }
      _ => Some(line.to_string()),
    }
  }
}

fn assistant_text(value: &serde_json::Value) -> String {
  let Some(content) = value
    .get("message")
    .and_then(|m| m.get("content"))
    .and_then(serde_json::Value::as_array)
  else {
    return String::new();
  };
  content
    .iter()
    .filter_map(|block| {
      if block.get("type").and_then(serde_json::Value::as_str) == Some("text") {
        block.get("text").and_then(serde_json::Value::as_str)
      } else {
        None
      }
    })
    .collect::<Vec<_>>()
    .join("\n")
}
