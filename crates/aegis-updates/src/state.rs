//! Coarse registry state machine and activity reports.
//!
//! One operation runs at a time: the async operation lock serializes
//! `checking`, `downloading`, and `fetching` so they never observably
//! overlap. Observers are plain callbacks; keep them cheap, they run inline
//! on the operating task.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// Registry activity, as visible to surrounding observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Ready,
    Checking,
    Downloading,
    Fetching,
}

impl std::fmt::Display for RegistryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryState::Ready => write!(f, "ready"),
            RegistryState::Checking => write!(f, "checking"),
            RegistryState::Downloading => write!(f, "downloading"),
            RegistryState::Fetching => write!(f, "fetching"),
        }
    }
}

pub type StateObserver = Box<dyn Fn(RegistryState) + Send + Sync>;

/// Outcome of an update check or a download batch.
#[derive(Debug, Clone)]
pub struct ActivityReport {
    /// Human-readable `<identifier> v<version>` lines.
    pub resources: Vec<String>,
    /// The most recent error; `None` on success.
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

pub(crate) struct StateReporter {
    op_lock: AsyncMutex<()>,
    inner: Mutex<ReporterInner>,
}

#[derive(Default)]
struct ReporterInner {
    state: Option<RegistryState>,
    observers: Vec<StateObserver>,
    last_success: Option<DateTime<Utc>>,
    last_update_check: Option<ActivityReport>,
    last_download: Option<ActivityReport>,
}

/// Holds the operation lock; restores `Ready` on drop.
pub(crate) struct OperationGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    reporter: &'a StateReporter,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.reporter.set_state(RegistryState::Ready);
    }
}

impl StateReporter {
    pub fn new() -> Self {
        Self {
            op_lock: AsyncMutex::new(()),
            inner: Mutex::new(ReporterInner::default()),
        }
    }

    /// Acquire the operation lock and enter `state`.
    pub async fn start_operation(&self, state: RegistryState) -> OperationGuard<'_> {
        let permit = self.op_lock.lock().await;
        self.set_state(state);
        OperationGuard {
            _permit: permit,
            reporter: self,
        }
    }

    pub fn state(&self) -> RegistryState {
        self.lock().state.unwrap_or(RegistryState::Ready)
    }

    pub fn on_state_change(&self, observer: StateObserver) {
        self.lock().observers.push(observer);
    }

    pub fn record_update_check(&self, resources: Vec<String>, error: Option<String>) {
        let mut inner = self.lock();
        if error.is_none() {
            inner.last_success = Some(Utc::now());
        }
        inner.last_update_check = Some(ActivityReport {
            resources,
            error,
            at: Utc::now(),
        });
    }

    pub fn record_download(&self, resources: Vec<String>, error: Option<String>) {
        let mut inner = self.lock();
        if error.is_none() {
            inner.last_success = Some(Utc::now());
        }
        inner.last_download = Some(ActivityReport {
            resources,
            error,
            at: Utc::now(),
        });
    }

    pub fn last_update_check(&self) -> Option<ActivityReport> {
        self.lock().last_update_check.clone()
    }

    pub fn last_download(&self) -> Option<ActivityReport> {
        self.lock().last_download.clone()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.lock().last_success
    }

    fn set_state(&self, state: RegistryState) {
        let mut inner = self.lock();
        inner.state = Some(state);
        for observer in &inner.observers {
            observer(state);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
