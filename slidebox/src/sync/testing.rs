use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use slidebox_core::{RemoteError, StatusCode};
use tokio::sync::Semaphore;

use super::{Credential, MetadataSink};
use crate::model::UserMetadataRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Write {
        item_id: String,
        token: String,
        record: UserMetadataRecord,
    },
    Delete {
        item_id: String,
        token: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum Scripted {
    Unauthorized,
    Fail(StatusCode),
}

#[derive(Default)]
struct Inner {
    calls: Mutex<Vec<SinkCall>>,
    remote: Mutex<HashMap<String, UserMetadataRecord>>,
    scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
    gate: Option<Arc<Semaphore>>,
}

/// In-memory document store that records every call and can be told to fail
/// or to block until released.
#[derive(Clone, Default)]
pub struct FakeSink {
    inner: Arc<Inner>,
}

impl FakeSink {
    /// Every call waits for a permit on the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Self {
            inner: Arc::new(Inner {
                gate: Some(Arc::clone(&gate)),
                ..Inner::default()
            }),
        };
        (sink, gate)
    }

    /// Queues an outcome for the next call on `item_id`.
    pub fn script(&self, item_id: &str, outcome: Scripted) {
        self.inner
            .scripted
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn remote_record(&self, item_id: &str) -> Option<UserMetadataRecord> {
        self.inner.remote.lock().unwrap().get(item_id).cloned()
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.inner.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
    }

    fn scripted_outcome(&self, item_id: &str) -> Result<(), RemoteError> {
        let next = self
            .inner
            .scripted
            .lock()
            .unwrap()
            .get_mut(item_id)
            .and_then(VecDeque::pop_front);
        let status = match next {
            None => return Ok(()),
            Some(Scripted::Unauthorized) => StatusCode::UNAUTHORIZED,
            Some(Scripted::Fail(status)) => status,
        };
        Err(RemoteError::Api {
            status,
            body: String::new(),
        })
    }
}

impl MetadataSink for FakeSink {
    async fn write_record(
        &self,
        credential: &Credential,
        item_id: &str,
        record: &UserMetadataRecord,
    ) -> Result<(), RemoteError> {
        self.pass_gate().await;
        self.inner.calls.lock().unwrap().push(SinkCall::Write {
            item_id: item_id.to_string(),
            token: credential.secret().to_string(),
            record: record.clone(),
        });
        self.scripted_outcome(item_id)?;
        self.inner
            .remote
            .lock()
            .unwrap()
            .insert(item_id.to_string(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, credential: &Credential, item_id: &str) -> Result<(), RemoteError> {
        self.pass_gate().await;
        self.inner.calls.lock().unwrap().push(SinkCall::Delete {
            item_id: item_id.to_string(),
            token: credential.secret().to_string(),
        });
        self.scripted_outcome(item_id)?;
        self.inner.remote.lock().unwrap().remove(item_id);
        Ok(())
    }
}
