//! Correlation of outbound requests with the result messages that answer
//! them.
//!
//! Every way an entry can end (a matching result, its timer, the periodic
//! sweep, a send failure, its client going away) removes the entry from
//! the same map. Whoever removes the entry finalizes it; everyone else
//! observes "not found" and does nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use metrics::{counter, gauge};
use relay_proto::{Envelope, MessageKind, RequestType};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CallError;

pub type CallResult = Result<Envelope, CallError>;

/// How a sink-bound caller wants its result rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseEncoding {
    #[default]
    Json,
    /// Decode the result's base64 `data` field and return the bytes.
    Raw,
}

/// Caller-supplied data the sink needs at completion time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkMetadata {
    pub encoding: ResponseEncoding,
    pub filename: Option<String>,
}

/// External response channel a sink-bound entry writes its outcome to.
pub trait ResponseSink: Send + Sync {
    fn finish(self: Box<Self>, outcome: CallResult, metadata: &SinkMetadata);
}

/// Who is waiting on an entry.
pub enum Waiter {
    Sink {
        sink: Box<dyn ResponseSink>,
        metadata: SinkMetadata,
    },
    /// The sender carries both continuations: `Ok` resolves, `Err` rejects.
    Promise(oneshot::Sender<CallResult>),
}

impl Waiter {
    pub fn finish(self, outcome: CallResult) {
        match self {
            Waiter::Sink { sink, metadata } => sink.finish(outcome, &metadata),
            Waiter::Promise(tx) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(outcome);
            }
        }
    }
}

pub struct PendingEntry {
    request_type: RequestType,
    client_id: String,
    /// Connection the request was written to; a later client reusing the
    /// id has a different one.
    connection_id: Uuid,
    created_at: Instant,
    waiter: Waiter,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    pub fn new(
        request_type: RequestType,
        client_id: impl Into<String>,
        connection_id: Uuid,
        waiter: Waiter,
    ) -> Self {
        Self {
            request_type,
            client_id: client_id.into(),
            connection_id,
            created_at: Instant::now(),
            waiter,
            timer: None,
        }
    }

    fn answers(&self, kind: &MessageKind, responder: &str) -> bool {
        *kind == MessageKind::Result(self.request_type) && self.client_id == responder
    }

    fn finalize(mut self, outcome: CallResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let label = match &outcome {
            Ok(_) => "completed",
            Err(err) => err.outcome(),
        };
        counter!(
            "beach_relay_requests_total",
            1,
            "type" => self.request_type.as_str(),
            "outcome" => label
        );
        self.waiter.finish(outcome);
    }
}

/// Outstanding requests keyed by request id.
#[derive(Default)]
pub struct PendingRequestTable {
    entries: DashMap<String, PendingEntry>,
    sequence: AtomicU64,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `{type}_{unix millis}_{sequence}`; unique among outstanding requests.
    pub fn next_request_id(&self, request_type: RequestType) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", request_type.as_str(), millis, sequence)
    }

    /// Callers guarantee `request_id` is fresh.
    pub fn register(&self, request_id: String, entry: PendingEntry) {
        self.entries.insert(request_id, entry);
        gauge!("beach_relay_requests_pending", self.entries.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    fn take(&self, request_id: &str) -> Option<PendingEntry> {
        let taken = self.entries.remove(request_id).map(|(_, entry)| entry);
        if taken.is_some() {
            gauge!("beach_relay_requests_pending", self.entries.len() as f64);
        }
        taken
    }

    /// Resolves the entry `result` answers. A result whose type or sender
    /// does not match the entry leaves it in place. Returns whether an
    /// entry was finalized.
    pub fn complete(&self, request_id: &str, responder: &str, result: Envelope) -> bool {
        let kind = result.message_kind();
        let taken = self
            .entries
            .remove_if(request_id, |_, entry| entry.answers(&kind, responder))
            .map(|(_, entry)| entry);

        let Some(entry) = taken else {
            if self.entries.contains_key(request_id) {
                warn!(
                    request_id,
                    client_id = responder,
                    message_type = %result.kind,
                    "result does not match the pending request; dropped"
                );
            } else {
                debug!(
                    request_id,
                    client_id = responder,
                    message_type = %result.kind,
                    "no pending request for result; dropped"
                );
            }
            counter!("beach_relay_results_unmatched_total", 1);
            return false;
        };
        gauge!("beach_relay_requests_pending", self.entries.len() as f64);

        let outcome = match result.error() {
            Some(message) => Err(CallError::Remote(message.to_string())),
            None => Ok(result),
        };
        entry.finalize(outcome);
        true
    }

    /// Finalizes the entry with `error` if it is still outstanding.
    pub fn fail(&self, request_id: &str, error: CallError) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                entry.finalize(Err(error));
                true
            }
            None => false,
        }
    }

    /// Times the entry out if nothing else has finalized it yet.
    pub fn expire(&self, request_id: &str) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                let error = CallError::TimedOut {
                    request_type: entry.request_type,
                    request_id: request_id.to_string(),
                    elapsed: entry.created_at.elapsed(),
                };
                debug!(request_id, client_id = %entry.client_id, "pending request timed out");
                entry.finalize(Err(error));
                true
            }
            None => false,
        }
    }

    /// Arms a one-shot timer that expires the entry after `after`.
    pub fn schedule_timeout(self: &Arc<Self>, request_id: &str, after: Duration) {
        let table: Weak<Self> = Arc::downgrade(self);
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(table) = table.upgrade() {
                table.expire(&id);
            }
        });
        match self.entries.get_mut(request_id) {
            Some(mut entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    /// Fails every entry sent to `client_id` over `connection_id`. Entries
    /// sent to a newer connection under the same id are left alone.
    pub fn fail_client(&self, client_id: &str, connection_id: Uuid) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.client_id == client_id && entry.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0usize;
        for request_id in ids {
            let error = CallError::ClientDisconnected {
                client_id: client_id.to_string(),
                request_id: request_id.clone(),
            };
            if self.fail(&request_id, error) {
                failed += 1;
            }
        }
        if failed > 0 {
            info!(client_id, failed, "failed pending requests of disconnected client");
        }
        failed
    }

    /// Force-expires entries older than `max_age`, whether or not their own
    /// timer was ever armed.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.created_at.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0usize;
        for request_id in ids {
            if self.expire(&request_id) {
                expired += 1;
            }
        }
        if expired > 0 {
            warn!(expired, "swept pending requests past their hard ceiling");
        }
        expired
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let table = Arc::clone(self);
        let mut interval = tokio::time::interval(every);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                table.sweep_expired(max_age);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn result(value: serde_json::Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    fn promise(
        table: &PendingRequestTable,
        request_type: RequestType,
        client_id: &str,
    ) -> (String, oneshot::Receiver<CallResult>) {
        promise_on(table, request_type, client_id, Uuid::nil())
    }

    fn promise_on(
        table: &PendingRequestTable,
        request_type: RequestType,
        client_id: &str,
        connection_id: Uuid,
    ) -> (String, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let request_id = table.next_request_id(request_type);
        table.register(
            request_id.clone(),
            PendingEntry::new(request_type, client_id, connection_id, Waiter::Promise(tx)),
        );
        (request_id, rx)
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<(CallResult, SinkMetadata)>>>);

    impl ResponseSink for RecordingSink {
        fn finish(self: Box<Self>, outcome: CallResult, metadata: &SinkMetadata) {
            self.0.lock().push((outcome, metadata.clone()));
        }
    }

    #[test]
    fn table_can_be_shared_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PendingRequestTable>();
        assert_send_sync::<Arc<PendingRequestTable>>();
    }

    #[test]
    fn request_ids_carry_the_type_and_differ() {
        let table = PendingRequestTable::new();
        let first = table.next_request_id(RequestType::Rolls);
        let second = table.next_request_id(RequestType::Rolls);
        assert!(first.starts_with("rolls_"));
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_beats_a_later_timeout() {
        let table = Arc::new(PendingRequestTable::new());
        let (request_id, rx) = promise(&table, RequestType::Rolls, "c1");
        table.schedule_timeout(&request_id, Duration::from_secs(10));

        let answered = table.complete(
            &request_id,
            "c1",
            result(json!({"type": "rolls-result", "requestId": request_id, "data": [1, 2]})),
        );
        assert!(answered);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!table.expire(&request_id));
        let envelope = rx.await.unwrap().unwrap();
        assert_eq!(envelope.get("data"), Some(&json!([1, 2])));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_wins_and_late_result_is_ignored() {
        let table = Arc::new(PendingRequestTable::new());
        let (request_id, rx) = promise(&table, RequestType::Rolls, "c1");
        let started = Instant::now();
        table.schedule_timeout(&request_id, Duration::from_secs(10));

        let outcome = rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        match outcome {
            Err(CallError::TimedOut { request_type, .. }) => {
                assert_eq!(request_type, RequestType::Rolls)
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        let late = result(json!({"type": "rolls-result", "requestId": request_id}));
        assert!(!table.complete(&request_id, "c1", late));
    }

    #[tokio::test]
    async fn error_field_rejects_the_promise() {
        let table = PendingRequestTable::new();
        let (request_id, rx) = promise(&table, RequestType::Delete, "c1");

        table.complete(
            &request_id,
            "c1",
            result(json!({"type": "delete-result", "requestId": request_id, "error": "locked"})),
        );

        assert_eq!(rx.await.unwrap(), Err(CallError::Remote("locked".into())));
    }

    #[tokio::test]
    async fn mismatched_results_leave_the_entry_pending() {
        let table = PendingRequestTable::new();
        let (request_id, mut rx) = promise(&table, RequestType::Search, "c1");

        let wrong_type = result(json!({"type": "entity-result", "requestId": request_id}));
        assert!(!table.complete(&request_id, "c1", wrong_type));
        let wrong_client = result(json!({"type": "search-result", "requestId": request_id}));
        assert!(!table.complete(&request_id, "c2", wrong_client));
        assert!(table.contains(&request_id));
        assert!(rx.try_recv().is_err());

        let right = result(json!({"type": "search-result", "requestId": request_id}));
        assert!(table.complete(&request_id, "c1", right));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn sink_entries_receive_outcome_and_metadata_once() {
        let table = PendingRequestTable::new();
        let sink = RecordingSink::default();
        let metadata = SinkMetadata {
            encoding: ResponseEncoding::Raw,
            filename: Some("map.webp".into()),
        };
        table.register(
            "download-file_1_0".into(),
            PendingEntry::new(
                RequestType::DownloadFile,
                "c1",
                Uuid::nil(),
                Waiter::Sink {
                    sink: Box::new(sink.clone()),
                    metadata: metadata.clone(),
                },
            ),
        );

        let answer = result(json!({"type": "download-file-result", "requestId": "download-file_1_0", "data": "aGk="}));
        assert!(table.complete("download-file_1_0", "c1", answer.clone()));
        assert!(!table.fail("download-file_1_0", CallError::Abandoned("x".into())));

        let recorded = sink.0.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, Ok(answer));
        assert_eq!(recorded[0].1, metadata);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_entries_without_timers() {
        let table = PendingRequestTable::new();
        let (old_id, old_rx) = promise(&table, RequestType::Structure, "c1");
        tokio::time::advance(Duration::from_secs(31)).await;
        let (fresh_id, _fresh_rx) = promise(&table, RequestType::Structure, "c1");

        assert_eq!(table.sweep_expired(Duration::from_secs(30)), 1);
        assert!(!table.contains(&old_id));
        assert!(table.contains(&fresh_id));
        assert!(matches!(old_rx.await.unwrap(), Err(CallError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn failing_a_client_only_touches_its_entries() {
        let table = PendingRequestTable::new();
        let (first, first_rx) = promise(&table, RequestType::Rolls, "c1");
        let (second, second_rx) = promise(&table, RequestType::Entity, "c1");
        let (other, _other_rx) = promise(&table, RequestType::Rolls, "c2");

        assert_eq!(table.fail_client("c1", Uuid::nil()), 2);

        assert!(!table.contains(&first) && !table.contains(&second));
        assert!(table.contains(&other));
        assert!(matches!(
            first_rx.await.unwrap(),
            Err(CallError::ClientDisconnected { .. })
        ));
        assert!(matches!(
            second_rx.await.unwrap(),
            Err(CallError::ClientDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn failing_a_replaced_connection_spares_the_new_one() {
        let table = PendingRequestTable::new();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let (old_request, old_rx) = promise_on(&table, RequestType::Rolls, "c1", stale);
        let (new_request, mut new_rx) = promise_on(&table, RequestType::Rolls, "c1", fresh);

        assert_eq!(table.fail_client("c1", stale), 1);

        assert!(!table.contains(&old_request));
        assert!(table.contains(&new_request));
        assert!(new_rx.try_recv().is_err());
        assert!(matches!(
            old_rx.await.unwrap(),
            Err(CallError::ClientDisconnected { .. })
        ));
    }
}
