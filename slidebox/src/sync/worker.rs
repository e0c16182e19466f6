use std::collections::{HashMap, VecDeque};
use std::future::Future;

use slidebox_core::RemoteError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::{Credential, SyncBatch, WorkerCommand, WorkerEvent};
use crate::model::UserMetadataRecord;

/// Unauthorized responses in a row after which an item is failed instead of
/// waiting for yet another token.
pub const MAX_CONSECUTIVE_EXPIRIES: u32 = 3;

/// Remote side of a flush: whole-record replace and delete, keyed by item id.
pub trait MetadataSink: Send + Sync + 'static {
    fn write_record(
        &self,
        credential: &Credential,
        item_id: &str,
        record: &UserMetadataRecord,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn delete_record(
        &self,
        credential: &Credential,
        item_id: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

enum CycleEnd {
    Completed,
    Aborted,
    Disconnected,
}

enum TokenWait {
    Resumed(Credential),
    Aborted,
    Disconnected,
}

/// Worker loop. Processes one batch at a time, one item at a time, until the
/// command channel closes or nobody listens to events any more.
pub async fn run_worker<S: MetadataSink>(
    sink: S,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut deferred = VecDeque::new();
    loop {
        let batch = match deferred.pop_front() {
            Some(batch) => batch,
            None => match commands.recv().await {
                Some(WorkerCommand::Sync(batch)) => batch,
                Some(other) => {
                    debug!(?other, "ignoring command outside a sync cycle");
                    continue;
                }
                None => break,
            },
        };
        match run_cycle(&sink, batch, &mut commands, &events, &mut deferred).await {
            CycleEnd::Completed | CycleEnd::Aborted => {}
            CycleEnd::Disconnected => break,
        }
    }
    debug!("sync worker stopped");
}

async fn run_cycle<S: MetadataSink>(
    sink: &S,
    batch: SyncBatch,
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    deferred: &mut VecDeque<SyncBatch>,
) -> CycleEnd {
    let SyncBatch {
        mut credential,
        dirty_ids,
        records_by_id,
    } = batch;
    if events.send(WorkerEvent::SyncStart).is_err() {
        return CycleEnd::Disconnected;
    }

    let mut queue: VecDeque<String> = dirty_ids.into();
    let mut failed_ids = Vec::new();
    let mut expiries = 0;
    while let Some(item_id) = queue.pop_front() {
        let result = push_one(sink, &credential, &item_id, &records_by_id).await;
        let event = match result {
            Ok(()) => {
                expiries = 0;
                WorkerEvent::FileSuccess { item_id }
            }
            Err(err) if err.is_auth_expired() && expiries + 1 < MAX_CONSECUTIVE_EXPIRIES => {
                expiries += 1;
                if events.send(WorkerEvent::TokenExpired).is_err() {
                    return CycleEnd::Disconnected;
                }
                match wait_for_token(commands, deferred).await {
                    TokenWait::Resumed(next) => {
                        credential = next;
                        queue.push_front(item_id);
                        WorkerEvent::ResumeSync
                    }
                    TokenWait::Aborted => {
                        debug!("sync cycle aborted while waiting for a token");
                        return CycleEnd::Aborted;
                    }
                    TokenWait::Disconnected => return CycleEnd::Disconnected,
                }
            }
            Err(err) => {
                expiries = 0;
                warn!(item_id = %item_id, "metadata write failed: {err}");
                failed_ids.push(item_id.clone());
                WorkerEvent::FileFailure {
                    item_id,
                    reason: err.to_string(),
                }
            }
        };
        if events.send(event).is_err() {
            return CycleEnd::Disconnected;
        }
    }

    if events
        .send(WorkerEvent::SyncComplete { failed_ids })
        .is_err()
    {
        return CycleEnd::Disconnected;
    }
    CycleEnd::Completed
}

async fn push_one<S: MetadataSink>(
    sink: &S,
    credential: &Credential,
    item_id: &str,
    records_by_id: &HashMap<String, UserMetadataRecord>,
) -> Result<(), RemoteError> {
    match records_by_id.get(item_id) {
        Some(record) => sink.write_record(credential, item_id, record).await,
        None => sink.delete_record(credential, item_id).await,
    }
}

async fn wait_for_token(
    commands: &mut mpsc::UnboundedReceiver<WorkerCommand>,
    deferred: &mut VecDeque<SyncBatch>,
) -> TokenWait {
    loop {
        match commands.recv().await {
            Some(WorkerCommand::NewToken { credential }) => return TokenWait::Resumed(credential),
            Some(WorkerCommand::Abort) => return TokenWait::Aborted,
            Some(WorkerCommand::Sync(batch)) => {
                debug!("deferring sync request until the paused cycle ends");
                deferred.push_back(batch);
            }
            None => return TokenWait::Disconnected,
        }
    }
}
