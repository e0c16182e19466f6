//! Write-behind flushing of the dirty set to a companion-document store.
//!
//! The coordinator lives with the triage state and owns the dirty set; the
//! worker runs in its own task and only sees copies sent as messages.

mod coordinator;
mod messages;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{
    CredentialReply, SyncCoordinator, SyncError, SyncEvent, SyncReport, SyncState, SyncTrigger,
    TriggerOutcome,
};
pub use messages::{Credential, SyncBatch, WorkerCommand, WorkerEvent};
pub use worker::{MAX_CONSECUTIVE_EXPIRIES, MetadataSink, run_worker};
