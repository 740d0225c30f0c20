use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;

/// Probes and signals operating-system processes.
///
/// Behind a trait so tests can substitute a fake process table instead of
/// touching real pids.
pub trait ProcessProbe: Send + Sync {
  /// Zero-effect signal probe. A permission error counts as alive: the
  /// process exists, we just cannot signal it, and assuming death would
  /// produce false "completed" states.
  fn is_alive(&self, pid: i32) -> bool;

  /// Best-effort SIGTERM. Returns true when the signal was delivered.
  fn terminate(&self, pid: i32) -> bool;
}

pub struct OsProcesses;

impl ProcessProbe for OsProcesses {
  fn is_alive(&self, pid: i32) -> bool {
    if pid <= 0 {
      return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
      Ok(()) => true,
      Err(Errno::EPERM) => true,
      Err(_) => false,
    }
  }

  fn terminate(&self, pid: i32) -> bool {
    if pid <= 0 {
      return false;
    }
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
  }
}

/// Metadata about a child this process spawned. Never persisted; durable
/// liveness is always derived from the stored pid plus a probe.
#[derive(Debug, Clone)]
pub struct ChildMeta {
  pub pid: i32,
  pub raw_args: Vec<String>,
  pub log_file: PathBuf,
  pub detached: bool,
  pub launched_at: DateTime<Utc>,
}

/// In-process registry of spawned children plus the injected probe.
///
/// Constructed once per CLI invocation and passed to every component that
/// spawns or probes processes.
pub struct ProcessRegistry {
  probe: Arc<dyn ProcessProbe>,
  children: Mutex<HashMap<i32, ChildMeta>>,
}

impl ProcessRegistry {
  pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
    Self {
      probe,
      children: Mutex::new(HashMap::new()),
    }
  }

  pub fn register(&self, meta: ChildMeta) {
    self.children.lock().insert(meta.pid, meta);
  }

  #[must_use]
  pub fn get(&self, pid: i32) -> Option<ChildMeta> {
    self.children.lock().get(&pid).cloned()
  }

  /// Probe a stored pid; `None` pids are never alive.
  #[must_use]
  pub fn pid_alive(&self, pid: Option<i32>) -> bool {
    pid.is_some_and(|pid| self.probe.is_alive(pid))
  }

  #[must_use]
  pub fn probe(&self) -> &dyn ProcessProbe {
    self.probe.as_ref()
  }
}

impl ProcessProbe for ProcessRegistry {
  fn is_alive(&self, pid: i32) -> bool {
    self.probe.is_alive(pid)
  }

  fn terminate(&self, pid: i32) -> bool {
    self.probe.terminate(pid)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn own_pid_is_alive() {
    let probe = OsProcesses;
    assert!(probe.is_alive(std::process::id() as i32));
  }

  #[test]
  fn nonsense_pids_are_dead() {
    let probe = OsProcesses;
    assert!(!probe.is_alive(0));
    assert!(!probe.is_alive(-4));
  }

  #[test]
  fn registry_tracks_children_and_probes() {
    let registry = ProcessRegistry::new(Arc::new(testing::FakeProcesses::with_alive(&[42])));
    registry.register(ChildMeta {
      pid: 42,
      raw_args: vec!["run".to_string()],
      log_file: PathBuf::from("/tmp/x.log"),
      detached: true,
      launched_at: Utc::now(),
    });

    assert!(registry.get(42).is_some());
    assert!(registry.pid_alive(Some(42)));
    assert!(!registry.pid_alive(Some(7)));
    assert!(!registry.pid_alive(None));
  }
}
