use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use assert_cmd::Command;
use tempfile::{Builder, TempDir};

use dispatch::session_store::SessionStore;

pub const STUB_SESSION_ID: &str = "11111111-2222-4333-8444-555566667777";

const DEFAULT_CONFIG: &str = r#"
[agents.demo]
executor = "claude"

[executors.claude]
binary = "fake-agent"
"#;

const DEFAULT_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"11111111-2222-4333-8444-555566667777"}'
echo "agent output line"
exit 0
"#;

#[derive(Debug)]
pub struct TestEnv {
  temp: TempDir,
  xdg_home: PathBuf,
  bin_dir: PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let root = tmp_root();
    let temp = Builder::new()
      .prefix("dispatch-test-")
      .tempdir_in(root)
      .expect("temp dir");

    let nanos = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map(|duration| duration.as_nanos())
      .unwrap_or(0);
    let xdg_home = tmp_root().join(format!("xdg-{nanos}"));
    let bin_dir = xdg_home.join("bin");
    let _ = std::fs::create_dir_all(&bin_dir);

    let env = Self {
      temp,
      xdg_home,
      bin_dir,
    };
    env
      .write_project_config(DEFAULT_CONFIG)
      .expect("write default config");
    env
      .write_stub("fake-agent", DEFAULT_STUB)
      .expect("write default stub");
    env
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn store_path(&self) -> PathBuf {
    self
      .path()
      .join(".dispatch")
      .join("state")
      .join("sessions.json")
  }

  pub fn write_project_config(&self, body: &str) -> Result<()> {
    let dir = self.path().join(".dispatch");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("dispatch.toml"), body)?;
    Ok(())
  }

  /// Place an executable stub on the PATH used by `dispatch()` commands.
  pub fn write_stub(&self, name: &str, body: &str) -> Result<PathBuf> {
    let path = self.bin_dir.join(name);
    std::fs::write(&path, body)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt as _;
      let mut perms = std::fs::metadata(&path)?.permissions();
      perms.set_mode(0o755);
      std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
  }

  pub fn dispatch(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("dispatch")?;
    cmd.current_dir(self.path());
    let path_value = match std::env::var("PATH") {
      Ok(existing) if !existing.is_empty() => {
        format!("{}:{existing}", self.bin_dir.display())
      }
      _ => self.bin_dir.display().to_string(),
    };
    cmd.env("PATH", path_value);
    cmd.env("XDG_CONFIG_HOME", &self.xdg_home);
    cmd.env("HOME", self.path());
    cmd.env_remove("DISPATCH_BACKGROUND_RUNNER");
    cmd.env_remove("DISPATCH_START_TIME");
    cmd.env_remove("DISPATCH_LOG_FILE");
    Ok(cmd)
  }

  pub fn load_store(&self) -> SessionStore {
    SessionStore::load(&self.store_path())
  }

  /// Poll the store until `pred` holds or the timeout elapses.
  pub fn wait_for_store(
    &self,
    timeout: Duration,
    pred: impl Fn(&SessionStore) -> bool,
  ) -> SessionStore {
    let start = Instant::now();
    loop {
      let store = self.load_store();
      if pred(&store) {
        return store;
      }
      if start.elapsed() > timeout {
        panic!("timed out waiting for store condition; store: {store:?}");
      }
      std::thread::sleep(Duration::from_millis(200));
    }
  }
}

pub fn tmp_root() -> PathBuf {
  let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  let workspace_root = manifest_dir
    .parent()
    .and_then(|parent| parent.parent())
    .unwrap_or(&manifest_dir)
    .to_path_buf();
  let root = workspace_root.join("target").join("test-tmp");
  let _ = std::fs::create_dir_all(&root);
  root
}
