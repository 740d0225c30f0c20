use chrono::{DateTime, Duration, Utc};
use owo_colors::OwoColorize as _;

use crate::runner::process::ProcessProbe;
use crate::session_store::{SessionRecord, SessionStatus, SessionStore};

/// Read-time status combining the persisted state with live process checks.
/// `PendingCompletion` is only ever derived here, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayStatus {
  Running,
  PendingCompletion,
  Completed,
  Failed(Option<i32>),
  Stopped,
  Abandoned,
  Starting,
}

impl DisplayStatus {
  #[must_use]
  pub fn label(&self) -> String {
    match self {
      DisplayStatus::Running => "running".green().to_string(),
      DisplayStatus::PendingCompletion => "pending-completion".yellow().to_string(),
      DisplayStatus::Completed => "completed".green().to_string(),
      DisplayStatus::Failed(Some(code)) => format!("failed ({code})").red().to_string(),
      DisplayStatus::Failed(None) => "failed".red().to_string(),
      DisplayStatus::Stopped => "stopped".red().to_string(),
      DisplayStatus::Abandoned => "abandoned".yellow().to_string(),
      DisplayStatus::Starting => "starting".yellow().to_string(),
    }
  }
}

/// Derive the display status for a record. Pure: never mutates the store;
/// callers that see a settled terminal state write it back themselves.
#[must_use]
pub fn resolve_display_status(record: &SessionRecord, probe: &dyn ProcessProbe) -> DisplayStatus {
  let executor_alive = record.executor_pid.is_some_and(|pid| probe.is_alive(pid));
  let runner_alive = record.runner_pid.is_some_and(|pid| probe.is_alive(pid));

  match record.status {
    SessionStatus::Running => {
      if executor_alive {
        return DisplayStatus::Running;
      }
      if runner_alive {
        return DisplayStatus::PendingCompletion;
      }
      match record.exit_code {
        Some(0) => DisplayStatus::Completed,
        Some(code) => DisplayStatus::Failed(Some(code)),
        None => DisplayStatus::Stopped,
      }
    }
    SessionStatus::Completed => DisplayStatus::Completed,
    SessionStatus::Failed => DisplayStatus::Failed(record.exit_code),
    other => {
      // Liveness overrides stale terminal or starting states
      if runner_alive || executor_alive {
        return DisplayStatus::Running;
      }
      match other {
        SessionStatus::Starting => DisplayStatus::Starting,
        SessionStatus::Stopped => DisplayStatus::Stopped,
        SessionStatus::Abandoned => DisplayStatus::Abandoned,
        // Running/Completed/Failed handled above
        _ => DisplayStatus::Stopped,
      }
    }
  }
}

/// Reconcile stored state with reality while listing.
///
/// Settles `running` records whose process already exited (the
/// pending-completion case after the runner died mid-save) and reclassifies
/// long-idle records with no live processes as `abandoned`. Returns true
/// when anything changed, so the caller saves exactly once.
pub fn sweep(
  store: &mut SessionStore,
  probe: &dyn ProcessProbe,
  now: DateTime<Utc>,
  abandoned_after: Duration,
) -> bool {
  let mut changed = false;
  for record in store.sessions.values_mut() {
    if !record.status.is_active() {
      continue;
    }
    let executor_alive = record.executor_pid.is_some_and(|pid| probe.is_alive(pid));
    let runner_alive = record.runner_pid.is_some_and(|pid| probe.is_alive(pid));
    if executor_alive || runner_alive {
      continue;
    }
    match record.exit_code {
      Some(0) => {
        record.status = SessionStatus::Completed;
        changed = true;
      }
      Some(_) => {
        record.status = SessionStatus::Failed;
        changed = true;
      }
      None => {
        if now - record.last_used >= abandoned_after {
          record.status = SessionStatus::Abandoned;
          changed = true;
        }
      }
    }
  }
  changed
}
