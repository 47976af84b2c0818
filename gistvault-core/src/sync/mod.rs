//! Backup and restore through the remote store.
//!
//! - [`SyncOrchestrator`] does the remote work: locate, push, pull, poll checks
//! - [`SyncSession`] owns the background tasks: debounced auto-backup,
//!   polling auto-restore and the sync-state observers

pub mod config;
pub mod orchestrator;
pub mod session;
pub mod task;

pub use config::{BackupHistoryEntry, SyncSettings};
pub use orchestrator::{
    BackupReceipt, PollOutcome, RestoreReport, SyncOrchestrator, SyncStatus, DEVICE_LOCAL_WARNING,
};
pub use session::{SubscriptionId, SyncObserver, SyncSession};
pub use task::{CancelToken, TaskState};
