use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use toml::Value as TomlValue;

use crate::runner::process::ProcessRegistry;

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["defaults", "background", "agents", "executors"];

/// Known keys within `[defaults]`.
const KNOWN_DEFAULTS_KEYS: &[&str] = &["executor", "mode"];

/// Known keys within `[background]`.
const KNOWN_BACKGROUND_KEYS: &[&str] = &[
  "enabled",
  "session_extraction_delay_ms",
  "session_match_window_secs",
  "abandoned_after_hours",
];

/// Known keys within each `[agents.<name>]` section.
const KNOWN_AGENT_KEYS: &[&str] = &["executor", "mode", "background", "instructions"];

// Embed repository defaults
const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/dispatch.toml"));

/// Embedded config template with all options commented out for documentation.
const CONFIG_TEMPLATE: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/dispatch.template.toml"));

/// Returns the config template with all options commented out.
///
/// Use this when generating new config files to show users available options.
#[must_use]
pub fn config_template() -> &'static str {
  CONFIG_TEMPLATE
}

fn default_true() -> bool {
  true
}

fn default_extraction_delay_ms() -> u64 {
  5000
}

fn default_match_window_secs() -> u64 {
  60
}

fn default_abandoned_after_hours() -> u64 {
  24
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
  #[serde(default = "default_executor_key")]
  pub executor: String,
  #[serde(default = "default_mode")]
  pub mode: String,
}

fn default_executor_key() -> String {
  "claude".to_string()
}

fn default_mode() -> String {
  "default".to_string()
}

impl Default for DefaultsConfig {
  fn default() -> Self {
    Self {
      executor: default_executor_key(),
      mode: default_mode(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Initial wait before the first session-id extraction attempt.
  #[serde(default = "default_extraction_delay_ms")]
  pub session_extraction_delay_ms: u64,
  /// Mtime tolerance when matching a session file to a run's start time.
  #[serde(default = "default_match_window_secs")]
  pub session_match_window_secs: u64,
  /// Idle threshold after which dead `running` records become `abandoned`.
  #[serde(default = "default_abandoned_after_hours")]
  pub abandoned_after_hours: u64,
}

impl Default for BackgroundConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      session_extraction_delay_ms: default_extraction_delay_ms(),
      session_match_window_secs: default_match_window_secs(),
      abandoned_after_hours: default_abandoned_after_hours(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
  /// Executor key; falls back to `defaults.executor` when unset.
  #[serde(default)]
  pub executor: Option<String>,
  #[serde(default)]
  pub mode: Option<String>,
  /// Default for the `--background` flag.
  #[serde(default)]
  pub background: Option<bool>,
  /// Instructions file handed to the executor on `run`.
  #[serde(default)]
  pub instructions: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeConfig {
  #[serde(default = "default_claude_binary")]
  pub binary: String,
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub permission_mode: Option<String>,
  #[serde(default)]
  pub allowed_tools: Vec<String>,
  #[serde(default)]
  pub disallowed_tools: Vec<String>,
  #[serde(default)]
  pub session_extraction_delay_ms: Option<u64>,
}

fn default_claude_binary() -> String {
  "claude".to_string()
}

impl Default for ClaudeConfig {
  fn default() -> Self {
    Self {
      binary: default_claude_binary(),
      model: None,
      permission_mode: None,
      allowed_tools: Vec::new(),
      disallowed_tools: Vec::new(),
      session_extraction_delay_ms: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodexConfig {
  #[serde(default = "default_codex_binary")]
  pub binary: String,
  #[serde(default)]
  pub model: Option<String>,
  #[serde(default)]
  pub sandbox: Option<String>,
  #[serde(default)]
  pub full_auto: bool,
  /// Where codex keeps its private session files. `~` is expanded.
  #[serde(default)]
  pub sessions_dir: Option<PathBuf>,
  #[serde(default)]
  pub additional_args: Vec<String>,
  #[serde(default)]
  pub session_extraction_delay_ms: Option<u64>,
}

fn default_codex_binary() -> String {
  "codex".to_string()
}

impl Default for CodexConfig {
  fn default() -> Self {
    Self {
      binary: default_codex_binary(),
      model: None,
      sandbox: None,
      full_auto: false,
      sessions_dir: None,
      additional_args: Vec::new(),
      session_extraction_delay_ms: None,
    }
  }
}

impl CodexConfig {
  /// Resolve the sessions dir, defaulting to `~/.codex/sessions`.
  #[must_use]
  pub fn resolved_sessions_dir(&self) -> Option<PathBuf> {
    let raw = match &self.sessions_dir {
      Some(dir) => dir.clone(),
      None => {
        let home = std::env::var("HOME").ok()?;
        return Some(PathBuf::from(home).join(".codex").join("sessions"));
      }
    };
    let text = raw.display().to_string();
    if let Some(rest) = text.strip_prefix("~/") {
      let home = std::env::var("HOME").ok()?;
      return Some(PathBuf::from(home).join(rest));
    }
    Some(raw)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorsConfig {
  #[serde(default)]
  pub claude: ClaudeConfig,
  #[serde(default)]
  pub codex: CodexConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchConfig {
  #[serde(default)]
  pub defaults: DefaultsConfig,
  #[serde(default)]
  pub background: BackgroundConfig,
  #[serde(default)]
  pub agents: BTreeMap<String, AgentConfig>,
  #[serde(default)]
  pub executors: ExecutorsConfig,
}

impl DispatchConfig {
  /// Return the agent config for `name` or a helpful error listing known agents.
  pub fn get_agent(&self, name: &str) -> Result<&AgentConfig> {
    if let Some(cfg) = self.agents.get(name) {
      Ok(cfg)
    } else {
      let known: Vec<String> = self.agents.keys().cloned().collect();
      anyhow::bail!("unknown agent: {name}. Known agents: {}", known.join(", "));
    }
  }
}

#[derive(Debug, Clone)]
pub struct DispatchPaths {
  root: PathBuf,
}

impl DispatchPaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  #[must_use]
  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  #[must_use]
  pub fn state_dir(&self) -> PathBuf {
    self.root.join(".dispatch").join("state")
  }

  #[must_use]
  pub fn sessions_file(&self) -> PathBuf {
    self.state_dir().join("sessions.json")
  }

  #[must_use]
  pub fn logs_dir(&self) -> PathBuf {
    self.state_dir().join("logs")
  }
}

#[derive(Clone)]
pub struct AppContext {
  pub paths: DispatchPaths,
  pub config: DispatchConfig,
  pub processes: Arc<ProcessRegistry>,
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match (base_tbl.get_mut(&k), v) {
          (Some(existing), new_v) => merge_values(existing, new_v),
          (None, new_v) => {
            base_tbl.insert(k, new_v);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_v) => *base_slot = new_v,
  }
}

/// Warn about unknown keys in a parsed TOML config file.
///
/// Checks top-level keys and nested sections against known key lists.
/// Unknown keys are logged as warnings to help users catch typos.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}' in {} (did you mean one of: {}?)",
        "warning".yellow(),
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  if let Some(TomlValue::Table(defaults)) = table.get("defaults") {
    for key in defaults.keys() {
      if !KNOWN_DEFAULTS_KEYS.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key 'defaults.{}' in {} (known keys: {})",
          "warning".yellow(),
          key,
          file_path.display(),
          KNOWN_DEFAULTS_KEYS.join(", ")
        );
      }
    }
  }

  if let Some(TomlValue::Table(background)) = table.get("background") {
    for key in background.keys() {
      if !KNOWN_BACKGROUND_KEYS.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key 'background.{}' in {} (known keys: {})",
          "warning".yellow(),
          key,
          file_path.display(),
          KNOWN_BACKGROUND_KEYS.join(", ")
        );
      }
    }
  }

  if let Some(TomlValue::Table(agents)) = table.get("agents") {
    for (agent_name, agent_val) in agents {
      let TomlValue::Table(agent_table) = agent_val else {
        continue;
      };
      for key in agent_table.keys() {
        if !KNOWN_AGENT_KEYS.contains(&key.as_str()) {
          eprintln!(
            "{}: unknown config key 'agents.{}.{}' in {} (known keys: {})",
            "warning".yellow(),
            agent_name,
            key,
            file_path.display(),
            KNOWN_AGENT_KEYS.join(", ")
          );
        }
      }
    }
  }
}

/// Load and merge configuration from defaults, global, and project files.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML, or if serialization of the merged config fails.
pub fn load_config(cwd: &Path) -> Result<DispatchConfig> {
  // Start with embedded defaults
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  // Merge global XDG config if present
  let xdg = xdg::BaseDirectories::with_prefix("dispatch");
  if let Some(global_path) = xdg.find_config_file("dispatch.toml") {
    let data = fs::read_to_string(&global_path)
      .with_context(|| format!("failed to read {}", global_path.display()))?;
    let val: TomlValue = toml::from_str(&data)
      .with_context(|| format!("invalid TOML in {}", global_path.display()))?;
    warn_unknown_keys(&val, &global_path);
    merge_values(&mut merged, val);
  }

  // Merge project config if present
  let project_cfg = cwd.join(".dispatch").join("dispatch.toml");
  if project_cfg.exists() {
    let data = fs::read_to_string(&project_cfg)
      .with_context(|| format!("failed to read {}", project_cfg.display()))?;
    let val: TomlValue = toml::from_str(&data)
      .with_context(|| format!("invalid TOML in {}", project_cfg.display()))?;
    warn_unknown_keys(&val, &project_cfg);
    merge_values(&mut merged, val);
  }

  // Deserialize into strongly typed config
  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: DispatchConfig = toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}
