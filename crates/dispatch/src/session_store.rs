use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log_warn;

pub const STORE_VERSION: u32 = 1;

/// Persisted lifecycle state of a run.
///
/// `pending-completion` is intentionally absent: it is a derived view
/// computed by the status resolver and never written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
  Starting,
  Running,
  Completed,
  Failed,
  Stopped,
  Abandoned,
}

impl SessionStatus {
  /// True for states that can still transition (a live or presumed-live run).
  #[must_use]
  pub fn is_active(self) -> bool {
    matches!(self, SessionStatus::Starting | SessionStatus::Running)
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      SessionStatus::Starting => "starting",
      SessionStatus::Running => "running",
      SessionStatus::Completed => "completed",
      SessionStatus::Failed => "failed",
      SessionStatus::Stopped => "stopped",
      SessionStatus::Abandoned => "abandoned",
    };
    f.write_str(label)
  }
}

fn now() -> DateTime<Utc> {
  Utc::now()
}

fn default_mode() -> String {
  "default".to_string()
}

fn default_executor() -> String {
  "claude".to_string()
}

/// One tracked run. Keyed in the store by its session identifier, which
/// starts out as a locally synthesized placeholder and is re-keyed once the
/// executor reports its own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
  #[serde(default)]
  pub agent: String,
  #[serde(default = "default_mode")]
  pub mode: String,
  #[serde(default = "default_executor")]
  pub executor: String,
  #[serde(default)]
  pub log_file: PathBuf,
  #[serde(default)]
  pub last_prompt: String,
  #[serde(default = "now")]
  pub created: DateTime<Utc>,
  #[serde(default = "now")]
  pub last_used: DateTime<Utc>,
  #[serde(default = "SessionRecord::default_status")]
  pub status: SessionStatus,
  #[serde(default)]
  pub background: bool,
  /// Pid of the detached runner generation. Only set when `background`.
  #[serde(default)]
  pub runner_pid: Option<i32>,
  /// Pid of the spawned executor process. Only set after the spawn succeeded.
  #[serde(default)]
  pub executor_pid: Option<i32>,
  #[serde(default)]
  pub exit_code: Option<i32>,
  #[serde(default)]
  pub signal: Option<String>,
  #[serde(default = "now")]
  pub start_time: DateTime<Utc>,
  /// Spawn-failure message, recorded for later inspection via `view`.
  #[serde(default)]
  pub error: Option<String>,
}

impl SessionRecord {
  fn default_status() -> SessionStatus {
    SessionStatus::Starting
  }
}

/// Maximum prompt length stored on a record.
pub const MAX_STORED_PROMPT: usize = 200;

/// Truncate a prompt to the stored limit without splitting a UTF-8 boundary.
#[must_use]
pub fn truncate_prompt(prompt: &str) -> String {
  if prompt.len() <= MAX_STORED_PROMPT {
    return prompt.to_string();
  }
  let mut end = MAX_STORED_PROMPT;
  while !prompt.is_char_boundary(end) {
    end -= 1;
  }
  prompt[..end].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStore {
  pub version: u32,
  pub sessions: BTreeMap<String, SessionRecord>,
}

impl Default for SessionStore {
  fn default() -> Self {
    Self {
      version: STORE_VERSION,
      sessions: BTreeMap::new(),
    }
  }
}

impl SessionStore {
  /// Load and normalize the store at `path`.
  ///
  /// Absent files yield an empty store. Unparsable files are reported as a
  /// warning and also yield an empty store; load never fails the CLI.
  #[must_use]
  pub fn load(path: &Path) -> SessionStore {
    let Ok(content) = fs::read_to_string(path) else {
      return SessionStore::default();
    };
    if content.trim().is_empty() {
      return SessionStore::default();
    }
    match serde_json::from_str::<serde_json::Value>(&content) {
      Ok(value) => normalize(value),
      Err(err) => {
        log_warn!("Could not parse {}: {err}", path.display());
        SessionStore::default()
      }
    }
  }

  /// Serialize the whole store and atomically replace `path`.
  ///
  /// The write goes to a sibling temp file first and is renamed into place,
  /// so readers never observe a partial store. There is no cross-process
  /// locking; two racing writers can still lose one update.
  pub fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(self).context("failed to serialize store")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
      .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
  }

  /// Find a record by session identifier.
  #[must_use]
  pub fn find(&self, session_id: &str) -> Option<&SessionRecord> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
      return None;
    }
    self.sessions.get(trimmed)
  }

  /// Find the record whose log file matches `log_file`.
  ///
  /// The detached runner generation uses this to adopt the record its
  /// launcher generation persisted, since both agree on one log file.
  #[must_use]
  pub fn find_by_log_file(&self, log_file: &Path) -> Option<(&String, &SessionRecord)> {
    self
      .sessions
      .iter()
      .find(|(_, record)| record.log_file == log_file)
  }
}

fn normalize(value: serde_json::Value) -> SessionStore {
  let serde_json::Value::Object(map) = value else {
    return SessionStore::default();
  };

  // Current shape: { version, sessions: { id: record } }
  if let Some(sessions) = map.get("sessions") {
    let version = map
      .get("version")
      .and_then(serde_json::Value::as_u64)
      .map_or(STORE_VERSION, |v| v as u32);
    return SessionStore {
      version,
      sessions: collect_records(sessions),
    };
  }

  // Legacy shape: a flat map of id -> record without the version wrapper.
  SessionStore {
    version: STORE_VERSION,
    sessions: collect_records(&serde_json::Value::Object(map)),
  }
}

fn collect_records(value: &serde_json::Value) -> BTreeMap<String, SessionRecord> {
  let mut sessions = BTreeMap::new();
  let serde_json::Value::Object(map) = value else {
    return sessions;
  };
  for (id, raw) in map {
    if !raw.is_object() {
      continue;
    }
    match serde_json::from_value::<SessionRecord>(raw.clone()) {
      Ok(record) => {
        sessions.insert(id.clone(), record);
      }
      Err(err) => {
        log_warn!("Skipping malformed session entry '{id}': {err}");
      }
    }
  }
  sessions
}
