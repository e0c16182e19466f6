use std::collections::HashMap;
use std::fmt;

use crate::model::UserMetadataRecord;

/// An access token as carried across the worker boundary.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// One flush: ids in dirty-set order, and the records of those not deleted.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub credential: Credential,
    pub dirty_ids: Vec<String>,
    pub records_by_id: HashMap<String, UserMetadataRecord>,
}

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Sync(SyncBatch),
    NewToken { credential: Credential },
    /// Drops the paused cycle without reporting completion.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    SyncStart,
    FileSuccess { item_id: String },
    FileFailure { item_id: String, reason: String },
    TokenExpired,
    ResumeSync,
    SyncComplete { failed_ids: Vec<String> },
}
