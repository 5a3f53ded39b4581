//! The environment hosting the agent: lifecycle state and page control.

use color_eyre::Result;
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, install not started
  Parsed,
  /// Install step running
  Installing,
  /// Install finished, waiting to take over
  Installed,
  /// Activate step running
  Activating,
  /// Active and controlling pages
  Activated,
}

impl WorkerState {
  /// Fetches are only intercepted once the worker controls pages.
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
    }
  }
}

/// Capabilities the agent needs from its host.
pub trait WorkerHost: Send + Sync {
  /// Activate this version as soon as install finishes, without waiting for
  /// older instances to release their pages.
  fn skip_waiting(&self);

  /// Take control of every open page immediately instead of on next reload.
  fn claim_clients(&self) -> Result<()>;

  fn set_state(&self, state: WorkerState);

  fn state(&self) -> WorkerState;
}

#[derive(Debug)]
struct HostInner {
  state: WorkerState,
  skip_waiting: bool,
  clients_claimed: bool,
}

/// In-process host used by the CLI and tests.
#[derive(Debug)]
pub struct LocalHost {
  inner: Mutex<HostInner>,
}

impl LocalHost {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(HostInner {
        state: WorkerState::Parsed,
        skip_waiting: false,
        clients_claimed: false,
      }),
    }
  }

  /// Host for an already-activated worker, as seen by a fresh process.
  pub fn activated() -> Self {
    let host = Self::new();
    host.set_state(WorkerState::Activated);
    host
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.lock().skip_waiting
  }

  pub fn clients_claimed(&self) -> bool {
    self.lock().clients_claimed
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HostInner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for LocalHost {
  fn default() -> Self {
    Self::new()
  }
}

impl WorkerHost for LocalHost {
  fn skip_waiting(&self) {
    self.lock().skip_waiting = true;
  }

  fn claim_clients(&self) -> Result<()> {
    self.lock().clients_claimed = true;
    info!("claimed open clients");
    Ok(())
  }

  fn set_state(&self, state: WorkerState) {
    let mut inner = self.lock();
    if inner.state != state {
      info!(from = %inner.state, to = %state, "worker state change");
      inner.state = state;
    }
  }

  fn state(&self) -> WorkerState {
    self.lock().state
  }
}
