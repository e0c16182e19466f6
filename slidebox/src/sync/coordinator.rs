use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{Credential, SyncBatch, WorkerCommand, WorkerEvent};
use super::worker::{MetadataSink, run_worker};
use crate::metadata::{DirtySet, DirtySnapshot, MetadataCache};
use crate::token_provider::{CredentialError, CredentialSource, SharedCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    TokenWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Explicit,
    VisibilityHidden,
    ProcessExit,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The dirty set was snapshotted; the batch goes out once a credential
    /// is at hand.
    Dispatched { items: usize },
    AlreadySyncing,
    NothingDirty,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync worker is not running")]
    WorkerGone,
}

/// Outcome of one finished or aborted cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub succeeded: usize,
    pub failed_ids: Vec<String>,
    /// Set when the cycle stopped early; every unconfirmed id was requeued.
    pub aborted: Option<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed_ids.is_empty() && self.aborted.is_none()
    }
}

/// Anything the owner of the coordinator has to feed back into it.
#[derive(Debug)]
pub enum SyncEvent {
    Worker(WorkerEvent),
    Credential(CredentialReply),
}

impl From<WorkerEvent> for SyncEvent {
    fn from(event: WorkerEvent) -> Self {
        SyncEvent::Worker(event)
    }
}

/// Result of a credential lookup that ran off the owner's task.
#[derive(Debug)]
pub struct CredentialReply {
    cycle: u64,
    purpose: CredentialPurpose,
    result: Result<Credential, CredentialError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialPurpose {
    /// First token of a cycle; the snapshot waits for it.
    Dispatch,
    /// Replacement after the worker hit an expired token.
    Resume,
}

struct Cycle {
    id: u64,
    trigger: SyncTrigger,
    /// Snapshot not yet handed to the worker.
    pending: Option<DirtySnapshot>,
    unconfirmed: DirtySet,
    succeeded: usize,
    failed: Vec<String>,
}

/// Drives the sync worker: decides when to flush, snapshots the dirty set,
/// supplies fresh credentials and folds outcomes back into the cache.
///
/// Credential lookups run on spawned tasks and come back through
/// [`recv_event`](Self::recv_event), so no method here waits on the network.
///
/// `Idle -> Syncing -> (TokenWait -> Syncing)* -> Idle`
pub struct SyncCoordinator<C> {
    credentials: SharedCredentials<C>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    reply_tx: mpsc::UnboundedSender<CredentialReply>,
    replies: mpsc::UnboundedReceiver<CredentialReply>,
    state: SyncState,
    cycle: Option<Cycle>,
    cycles_started: u64,
}

impl<C: CredentialSource> SyncCoordinator<C> {
    /// Spawns the worker task; must be called inside a Tokio runtime.
    pub fn spawn<S: MetadataSink>(sink: S, credentials: SharedCredentials<C>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(sink, command_rx, event_tx));
        Self {
            credentials,
            commands: command_tx,
            events: event_rx,
            reply_tx,
            replies: reply_rx,
            state: SyncState::Idle,
            cycle: None,
            cycles_started: 0,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SyncState::Idle
    }

    /// Starts a cycle unless one is running or nothing is dirty. The live
    /// dirty set is cleared as soon as the snapshot is taken; the batch is
    /// sent when the access token arrives.
    pub fn trigger(&mut self, metadata: &mut MetadataCache, trigger: SyncTrigger) -> TriggerOutcome {
        if self.state != SyncState::Idle {
            debug!(?trigger, "sync already in progress");
            return TriggerOutcome::AlreadySyncing;
        }
        if metadata.dirty_len() == 0 {
            return TriggerOutcome::NothingDirty;
        }

        let snapshot = metadata.snapshot_dirty();
        let items = snapshot.ids.len();
        let mut unconfirmed = DirtySet::default();
        for id in &snapshot.ids {
            unconfirmed.insert(id);
        }
        self.cycles_started += 1;
        let id = self.cycles_started;
        self.cycle = Some(Cycle {
            id,
            trigger,
            pending: Some(snapshot),
            unconfirmed,
            succeeded: 0,
            failed: Vec::new(),
        });
        self.state = SyncState::Syncing;
        self.request_credential(id, CredentialPurpose::Dispatch);
        debug!(?trigger, items, "metadata sync waiting for a credential");
        TriggerOutcome::Dispatched { items }
    }

    /// Next worker event or credential reply. Cancel safe; `None` once the
    /// worker is gone.
    pub async fn recv_event(&mut self) -> Option<SyncEvent> {
        tokio::select! {
            event = self.events.recv() => event.map(SyncEvent::Worker),
            Some(reply) = self.replies.recv() => Some(SyncEvent::Credential(reply)),
        }
    }

    /// Applies one event. Returns the report when a cycle ends.
    pub fn handle_event(
        &mut self,
        metadata: &mut MetadataCache,
        event: impl Into<SyncEvent>,
    ) -> Result<Option<SyncReport>, SyncError> {
        let event = match event.into() {
            SyncEvent::Worker(event) => event,
            SyncEvent::Credential(reply) => return self.credential_arrived(metadata, reply),
        };
        match event {
            WorkerEvent::SyncStart => debug!("worker started sync cycle"),
            WorkerEvent::FileSuccess { item_id } => {
                if let Some(cycle) = self.cycle.as_mut()
                    && cycle.unconfirmed.remove(&item_id)
                {
                    cycle.succeeded += 1;
                }
            }
            WorkerEvent::FileFailure { item_id, reason } => {
                debug!(item_id = %item_id, reason = %reason, "item failed to sync");
                if let Some(cycle) = self.cycle.as_mut()
                    && cycle.unconfirmed.remove(&item_id)
                {
                    cycle.failed.push(item_id);
                }
            }
            WorkerEvent::TokenExpired => {
                if let Some(cycle) = self.cycle.as_ref() {
                    let id = cycle.id;
                    self.state = SyncState::TokenWait;
                    self.request_credential(id, CredentialPurpose::Resume);
                }
            }
            WorkerEvent::ResumeSync => {
                if self.state == SyncState::TokenWait {
                    self.state = SyncState::Syncing;
                }
            }
            WorkerEvent::SyncComplete { failed_ids } => {
                return Ok(self.finish_cycle(metadata, failed_ids));
            }
        }
        Ok(None)
    }

    /// Processes events until the running cycle ends.
    pub async fn wait_idle(
        &mut self,
        metadata: &mut MetadataCache,
    ) -> Result<Option<SyncReport>, SyncError> {
        while self.state != SyncState::Idle {
            let Some(event) = self.recv_event().await else {
                self.worker_lost(metadata);
                return Err(SyncError::WorkerGone);
            };
            if let Some(report) = self.handle_event(metadata, event)? {
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    /// Waits out a running cycle, then flushes whatever is dirty now.
    pub async fn flush(
        &mut self,
        metadata: &mut MetadataCache,
        trigger: SyncTrigger,
    ) -> Result<Vec<SyncReport>, SyncError> {
        let mut reports = Vec::new();
        reports.extend(self.wait_idle(metadata).await?);
        if let TriggerOutcome::Dispatched { .. } = self.trigger(metadata, trigger) {
            reports.extend(self.wait_idle(metadata).await?);
        }
        Ok(reports)
    }

    /// Requeues the running cycle after the worker disappeared.
    pub fn worker_lost(&mut self, metadata: &mut MetadataCache) -> Option<SyncReport> {
        warn!("sync worker stopped unexpectedly");
        self.abandon_cycle(metadata, "sync worker stopped".to_string())
    }

    fn request_credential(&self, cycle: u64, purpose: CredentialPurpose) {
        let credentials = self.credentials.clone();
        let replies = self.reply_tx.clone();
        tokio::spawn(async move {
            let result = match purpose {
                CredentialPurpose::Dispatch => credentials.access_token().await,
                CredentialPurpose::Resume => credentials.refresh().await,
            };
            let _ = replies.send(CredentialReply {
                cycle,
                purpose,
                result: result.map(Credential::new),
            });
        });
    }

    fn credential_arrived(
        &mut self,
        metadata: &mut MetadataCache,
        reply: CredentialReply,
    ) -> Result<Option<SyncReport>, SyncError> {
        let Some(cycle) = self.cycle.as_mut().filter(|cycle| cycle.id == reply.cycle) else {
            debug!(cycle = reply.cycle, "dropping credential for a finished cycle");
            return Ok(None);
        };
        let credential = match reply.result {
            Ok(credential) => credential,
            Err(err) => {
                warn!("no credential for sync, aborting cycle: {err}");
                if reply.purpose == CredentialPurpose::Resume {
                    let _ = self.commands.send(WorkerCommand::Abort);
                }
                return Ok(self.abandon_cycle(metadata, err.to_string()));
            }
        };

        let command = match reply.purpose {
            CredentialPurpose::Dispatch => {
                let Some(snapshot) = cycle.pending.take() else {
                    return Ok(None);
                };
                info!(trigger = ?cycle.trigger, items = snapshot.ids.len(), "metadata sync dispatched");
                WorkerCommand::Sync(SyncBatch {
                    credential,
                    dirty_ids: snapshot.ids,
                    records_by_id: snapshot.records,
                })
            }
            CredentialPurpose::Resume => WorkerCommand::NewToken { credential },
        };
        if self.commands.send(command).is_err() {
            self.worker_lost(metadata);
            return Err(SyncError::WorkerGone);
        }
        Ok(None)
    }

    fn finish_cycle(&mut self, metadata: &mut MetadataCache, failed_ids: Vec<String>) -> Option<SyncReport> {
        self.state = SyncState::Idle;
        let mut cycle = self.cycle.take()?;
        let mut failed = failed_ids;
        for id in cycle.unconfirmed.take() {
            if !failed.contains(&id) {
                failed.push(id);
            }
        }
        metadata.requeue(failed.iter().cloned());
        info!(
            succeeded = cycle.succeeded,
            failed = failed.len(),
            "metadata sync finished"
        );
        Some(SyncReport {
            trigger: cycle.trigger,
            succeeded: cycle.succeeded,
            failed_ids: failed,
            aborted: None,
        })
    }

    fn abandon_cycle(&mut self, metadata: &mut MetadataCache, reason: String) -> Option<SyncReport> {
        self.state = SyncState::Idle;
        let mut cycle = self.cycle.take()?;
        let mut failed = cycle.failed;
        failed.extend(cycle.unconfirmed.take());
        metadata.requeue(failed.iter().cloned());
        Some(SyncReport {
            trigger: cycle.trigger,
            succeeded: cycle.succeeded,
            failed_ids: failed,
            aborted: Some(reason),
        })
    }
}
