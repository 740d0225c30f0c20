use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::DispatchConfig;
use crate::executors::Executor;
use crate::runner::execute::SessionTracker;

/// Follow-up delays after the adapter-declared initial delay. Preserved
/// from the source system; the initial delay is the configurable knob.
const FOLLOW_UP_DELAYS: [Duration; 3] = [
  Duration::from_secs(2),
  Duration::from_secs(3),
  Duration::from_secs(3),
];

/// A bounded schedule of waits between attempts. The one retry abstraction
/// shared by anything that needs to poll.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  delays: Vec<Duration>,
}

impl RetryPolicy {
  #[must_use]
  pub fn with_initial_delay(initial: Duration) -> Self {
    let mut delays = vec![initial];
    delays.extend(FOLLOW_UP_DELAYS);
    Self { delays }
  }

  #[must_use]
  pub fn delays(&self) -> &[Duration] {
    &self.delays
  }
}

/// Cooperative cancellation shared between the retry thread and its owner.
#[derive(Clone, Default)]
pub struct CancelToken {
  cancelled: Arc<AtomicBool>,
}

impl CancelToken {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Sleep in small slices so cancellation takes effect promptly.
  /// Returns false when cancelled mid-sleep.
  fn sleep(&self, duration: Duration) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = duration;
    while !remaining.is_zero() {
      if self.is_cancelled() {
        return false;
      }
      let step = remaining.min(slice);
      std::thread::sleep(step);
      remaining = remaining.saturating_sub(step);
    }
    !self.is_cancelled()
  }
}

fn session_id_pattern() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r#"(?i)"session_id"\s*:\s*"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})""#,
    )
    .expect("valid session id regex")
  })
}

/// Pull a session identifier out of one line of executor output.
#[must_use]
pub fn session_id_from_line(line: &str) -> Option<String> {
  session_id_pattern()
    .captures(line)
    .map(|captures| captures[1].to_string())
}

/// Cheap fallback at exit: scan the already-produced log file for the same
/// pattern the mid-stream watcher looks for. Covers executors that only
/// report the identifier once, at shutdown.
#[must_use]
pub fn scan_log_for_session_id(log_file: &Path) -> Option<String> {
  let content = fs::read_to_string(log_file).ok()?;
  content.lines().find_map(session_id_from_line)
}

/// Run the bounded extraction schedule on its own thread.
///
/// Each attempt asks the adapter whether a freshly-created session file
/// matches the run's start time. The first success re-keys the record and
/// stops; exhaustion leaves the placeholder id in place and is not an error.
pub fn spawn_session_recovery(
  tracker: Arc<SessionTracker>,
  executor: &'static dyn Executor,
  config: DispatchConfig,
  start_time: DateTime<Utc>,
  policy: RetryPolicy,
  token: CancelToken,
) -> JoinHandle<()> {
  std::thread::spawn(move || {
    for delay in policy.delays() {
      if !token.sleep(*delay) {
        return;
      }
      if let Some(session_id) = executor.extract_session_id(&config, start_time) {
        let _ = tracker.adopt_session_id(&session_id);
        return;
      }
    }
  })
}
