//! Sync session: sync-state observers, the debounced auto-backup and the
//! polling auto-restore.
//!
//! Background failures are logged and swallowed; user-initiated
//! [`SyncSession::backup_now`] and [`SyncSession::restore_now`] propagate.

use super::orchestrator::{
    BackupReceipt, PollOutcome, RestoreReport, SyncOrchestrator, SyncStatus,
};
use super::task::{CancelToken, TaskState};
use crate::accounts::AccountStore;
use crate::{Result, VaultError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback receiving `true` when sync work starts and `false` when it ends.
pub type SyncObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`SyncSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct DebounceSlot {
    generation: u64,
    state: TaskState,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PollerSlot {
    state: TaskState,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

struct SessionInner {
    orchestrator: Arc<SyncOrchestrator>,
    observers: Mutex<Vec<(SubscriptionId, SyncObserver)>>,
    next_subscription: AtomicU64,
    debounce: Mutex<DebounceSlot>,
    poller: Mutex<PollerSlot>,
}

/// Owns the background sync tasks for one vault. Cheap to clone.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

/// Transient failures are retried on the next trigger; anything else needs
/// the user's attention and is logged as an error.
fn log_background_failure(context: &str, e: &VaultError) {
    if e.is_transient() {
        warn!(error = %e, "{}", context);
    } else {
        error!(error = %e, "{}", context);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncSession {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                orchestrator,
                observers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                debounce: Mutex::new(DebounceSlot::default()),
                poller: Mutex::new(PollerSlot::default()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    /// Schedule a debounced backup after every local change to `accounts`.
    pub fn attach(&self, accounts: &AccountStore) {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        accounts.set_change_hook(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                SyncSession { inner }.schedule_backup();
            }
        }));
    }

    pub fn subscribe(&self, observer: SyncObserver) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.observers).push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = lock(&self.inner.observers);
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    /// Tell every observer whether sync work is in progress. A panicking
    /// observer is logged and does not affect the others.
    pub fn notify(&self, syncing: bool) {
        let observers: Vec<SyncObserver> = lock(&self.inner.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(syncing))).is_err() {
                warn!("Sync observer panicked; ignoring");
            }
        }
    }

    pub fn debounce_state(&self) -> TaskState {
        lock(&self.inner.debounce).state
    }

    pub fn poller_state(&self) -> TaskState {
        lock(&self.inner.poller).state
    }

    /// Schedule a backup after the quiet period. A pending, not yet running
    /// backup is cancelled and rescheduled; a running one finishes and the
    /// new one waits for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_backup(&self) {
        let delay = self.inner.orchestrator.settings().debounce();
        let mut slot = lock(&self.inner.debounce);

        if slot.state == TaskState::Scheduled {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
        slot.generation += 1;
        let generation = slot.generation;
        slot.state = TaskState::Scheduled;

        let session = self.clone();
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.run_debounced(generation).await;
        }));
        debug!(generation, "Backup scheduled");
    }

    async fn run_debounced(&self, generation: u64) {
        {
            let mut slot = lock(&self.inner.debounce);
            if slot.generation != generation || slot.state != TaskState::Scheduled {
                return;
            }
            slot.state = TaskState::Running;
        }

        self.notify(true);
        match self.inner.orchestrator.push().await {
            Ok(receipt) => debug!(id = %receipt.remote_id, "Automatic backup finished"),
            Err(VaultError::NothingToExport) => debug!("Automatic backup skipped: no accounts"),
            Err(e) => log_background_failure("Automatic backup failed", &e),
        }
        self.notify(false);

        let mut slot = lock(&self.inner.debounce);
        if slot.generation == generation {
            slot.state = TaskState::Idle;
            slot.handle = None;
        }
    }

    /// Drop a pending automatic backup that has not started yet.
    pub fn cancel_scheduled_backup(&self) {
        let mut slot = lock(&self.inner.debounce);
        if slot.state == TaskState::Scheduled {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
            slot.state = TaskState::Idle;
        }
    }

    /// User-initiated backup. Supersedes a pending automatic one.
    pub async fn backup_now(&self) -> Result<BackupReceipt> {
        self.cancel_scheduled_backup();
        self.notify(true);
        let result = self.inner.orchestrator.push().await;
        self.notify(false);
        result
    }

    /// User-initiated restore.
    pub async fn restore_now(&self, id: Option<&str>) -> Result<RestoreReport> {
        self.notify(true);
        let result = self.inner.orchestrator.pull(id).await;
        self.notify(false);
        result
    }

    /// Start the poller. Returns `false` if it is already running.
    ///
    /// The first poll runs immediately and only records the baseline.
    /// Must be called from within a tokio runtime.
    pub fn start_polling(&self) -> bool {
        let mut slot = lock(&self.inner.poller);
        if slot.state.is_active() {
            return false;
        }

        self.inner.orchestrator.reset_baseline();
        let cancel = CancelToken::new();
        let session = self.clone();
        let token = cancel.clone();
        slot.handle = Some(tokio::spawn(async move {
            session.poll_loop(token).await;
        }));
        slot.cancel = Some(cancel);
        slot.state = TaskState::Scheduled;

        info!(
            interval_secs = self.inner.orchestrator.settings().poll_interval().as_secs(),
            "Polling for remote changes"
        );
        true
    }

    /// Stop the poller. Safe to call when it was never started.
    pub fn stop_polling(&self) {
        let mut slot = lock(&self.inner.poller);
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
            info!("Stopped polling");
        }
        slot.handle = None;
        if slot.state != TaskState::Idle {
            slot.state = TaskState::Stopped;
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller_state().is_active()
    }

    async fn poll_loop(&self, cancel: CancelToken) {
        let interval = self.inner.orchestrator.settings().poll_interval();

        loop {
            if !self.set_poller_state(&cancel, TaskState::Running) {
                break;
            }

            let restoring = Arc::new(AtomicBool::new(false));
            let on_restore = {
                let session = self.clone();
                let restoring = restoring.clone();
                move || {
                    restoring.store(true, Ordering::Release);
                    session.notify(true);
                }
            };
            let outcome = self
                .inner
                .orchestrator
                .poll_once(Some(&cancel), &on_restore)
                .await;
            if restoring.load(Ordering::Acquire) {
                self.notify(false);
            }

            match outcome {
                Ok(PollOutcome::Restored(report)) => {
                    info!(
                        id = %report.remote_id,
                        accounts = report.account_count,
                        "Auto-restore finished"
                    );
                }
                Ok(PollOutcome::Discarded) => break,
                Ok(_) => {}
                Err(e) => log_background_failure("Remote poll failed", &e),
            }

            if !self.set_poller_state(&cancel, TaskState::Scheduled) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Update the poller state unless this loop has been cancelled.
    fn set_poller_state(&self, cancel: &CancelToken, state: TaskState) -> bool {
        let mut slot = lock(&self.inner.poller);
        if cancel.is_cancelled() {
            return false;
        }
        slot.state = state;
        true
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        self.cancel_scheduled_backup();
        self.stop_polling();
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let mut status = self.inner.orchestrator.status().await?;
        status.debounce = self.debounce_state();
        status.poller = self.poller_state();
        status.polling = status.poller.is_active();
        Ok(status)
    }
}
