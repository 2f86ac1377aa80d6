use async_trait::async_trait;
use review_core::{
    ChangeSet, ClassifiedError, Fetcher, FileDiff, LookupOutcome, ModelClient,
    NotificationPayload, NotificationProvider, SendReceipt,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;

/// Fetcher returning a fixed change set, with an optional queue of scripted
/// failures consumed before any success.
pub struct FakeFetcher {
    change_set: ChangeSet,
    failures: Mutex<VecDeque<ClassifiedError>>,
    calls: Mutex<u32>,
}

impl FakeFetcher {
    pub fn new(change_set: ChangeSet) -> Self {
        Self {
            change_set,
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    /// A one-file change set, enough for most pipeline tests.
    pub fn single_file(path: &str, patch: &str) -> Self {
        Self::new(ChangeSet {
            changed_files: vec![path.to_string()],
            diffs: vec![FileDiff {
                path: path.to_string(),
                patch: patch.to_string(),
            }],
        })
    }

    pub async fn push_failure(&self, err: ClassifiedError) {
        self.failures.lock().await.push_back(err);
    }

    pub async fn calls(&self) -> u32 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(
        &self,
        _changelist_id: i64,
        _allow_list: &[String],
    ) -> Result<ChangeSet, ClassifiedError> {
        *self.calls.lock().await += 1;
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        Ok(self.change_set.clone())
    }
}

/// Model client with a queue of scripted outcomes; when the queue is empty it
/// returns the default response.
pub struct FakeModelClient {
    default_response: Vec<u8>,
    script: Mutex<VecDeque<Result<Vec<u8>, ClassifiedError>>>,
    calls: Mutex<u32>,
}

impl FakeModelClient {
    pub fn new(default_response: Vec<u8>) -> Self {
        Self {
            default_response,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    pub async fn push_outcome(&self, outcome: Result<Vec<u8>, ClassifiedError>) {
        self.script.lock().await.push_back(outcome);
    }

    pub async fn calls(&self) -> u32 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl ModelClient for FakeModelClient {
    async fn review(
        &self,
        _prompt: &str,
        _diff: &str,
        _deadline: Duration,
    ) -> Result<Vec<u8>, ClassifiedError> {
        *self.calls.lock().await += 1;
        match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => Ok(self.default_response.clone()),
        }
    }
}

#[derive(Default)]
struct ProviderState {
    /// token -> (message id, successful send count)
    delivered: HashMap<String, (String, u32)>,
    send_failures: VecDeque<ClassifiedError>,
    rejected_recipients: HashSet<String>,
    preset_message_ids: VecDeque<String>,
    next_seq: u32,
}

/// Notification provider that records every send keyed by idempotency token
/// and serves `lookup` from the same record, which is exactly the contract
/// reconciliation relies on.
#[derive(Clone, Default)]
pub struct RecordingProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with the given classified error.
    pub async fn push_send_failure(&self, err: ClassifiedError) {
        self.state.lock().await.send_failures.push_back(err);
    }

    /// Permanently reject sends to a recipient (invalid address, policy).
    pub async fn reject_recipient(&self, recipient: &str) {
        self.state
            .lock()
            .await
            .rejected_recipients
            .insert(recipient.to_string());
    }

    /// Use a specific message id for the next fresh send.
    pub async fn preset_message_id(&self, message_id: &str) {
        self.state
            .lock()
            .await
            .preset_message_ids
            .push_back(message_id.to_string());
    }

    /// Drop the provider-side record for a token, so a later `lookup` returns
    /// `NotFound` for a message this provider previously acknowledged.
    pub async fn forget(&self, idempotency_token: &str) {
        self.state.lock().await.delivered.remove(idempotency_token);
    }

    /// Successful sends observed for a token (idempotent replays count once).
    pub async fn send_count(&self, token: &str) -> u32 {
        self.state
            .lock()
            .await
            .delivered
            .get(token)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub async fn total_sends(&self) -> u32 {
        self.state
            .lock()
            .await
            .delivered
            .values()
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
impl NotificationProvider for RecordingProvider {
    async fn send(
        &self,
        payload: &NotificationPayload,
        idempotency_token: &str,
        _deadline: Duration,
    ) -> Result<SendReceipt, ClassifiedError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        if state.rejected_recipients.contains(&payload.recipient) {
            return Err(ClassifiedError::new(
                review_core::ErrorClass::NotFoundPermanent,
                format!("recipient rejected: {}", payload.recipient),
            ));
        }
        if let Some((message_id, count)) = state.delivered.get_mut(idempotency_token) {
            // Idempotent replay: same token, same message id.
            let message_id = message_id.clone();
            *count += 1;
            return Ok(SendReceipt { message_id });
        }
        let message_id = match state.preset_message_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_seq += 1;
                format!("m-{}", state.next_seq)
            }
        };
        state
            .delivered
            .insert(idempotency_token.to_string(), (message_id.clone(), 1));
        Ok(SendReceipt { message_id })
    }

    async fn lookup(&self, idempotency_token: &str) -> Result<LookupOutcome, ClassifiedError> {
        let state = self.state.lock().await;
        Ok(match state.delivered.get(idempotency_token) {
            Some((message_id, _)) => LookupOutcome::Delivered {
                message_id: message_id.clone(),
            },
            None => LookupOutcome::NotFound,
        })
    }
}
