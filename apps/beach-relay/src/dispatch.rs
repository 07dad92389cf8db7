use std::sync::Arc;
use std::time::Duration;

use relay_proto::{Envelope, MessageKind, RequestType};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::pending::{
    CallResult, PendingEntry, PendingRequestTable, ResponseSink, SinkMetadata, Waiter,
};
use crate::registry::{ClientRegistry, RegistryBuilder};

/// Originates typed requests against connected peers and correlates the
/// answers through the pending table.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    pending: Arc<PendingRequestTable>,
    default_timeout: Duration,
}

impl Dispatcher {
    /// Subscribes one `{type}-result` handler per request type; each hands
    /// the result to `pending`.
    pub fn install(builder: RegistryBuilder, pending: &Arc<PendingRequestTable>) -> RegistryBuilder {
        RequestType::ALL.iter().fold(builder, |builder, request_type| {
            let pending = Arc::clone(pending);
            builder.on_message_type(MessageKind::Result(*request_type), move |client, result| {
                match result.request_id.as_deref() {
                    Some(request_id) => {
                        pending.complete(request_id, client.id(), result.clone());
                    }
                    None => warn!(
                        client_id = %client.id(),
                        message_type = %result.kind,
                        "result without requestId; dropped"
                    ),
                }
                Ok(())
            })
        })
    }

    pub fn new(
        registry: Arc<ClientRegistry>,
        pending: Arc<PendingRequestTable>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends `request_type` to `client_id` and waits for the matching
    /// result, an error reported by the peer, or the timeout.
    pub async fn call(
        &self,
        request_type: RequestType,
        client_id: &str,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> CallResult {
        let (tx, rx) = oneshot::channel();
        let request_id =
            self.dispatch(request_type, client_id, payload, timeout, Waiter::Promise(tx));
        rx.await
            .unwrap_or_else(|_| Err(CallError::Abandoned(request_id)))
    }

    /// Like [`Dispatcher::call`] but the outcome is written to `sink`
    /// instead of being returned. Returns the request id.
    pub fn call_into_sink(
        &self,
        request_type: RequestType,
        client_id: &str,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
        sink: Box<dyn ResponseSink>,
        metadata: SinkMetadata,
    ) -> String {
        self.dispatch(
            request_type,
            client_id,
            payload,
            timeout,
            Waiter::Sink { sink, metadata },
        )
    }

    fn dispatch(
        &self,
        request_type: RequestType,
        client_id: &str,
        payload: Map<String, Value>,
        timeout: Option<Duration>,
        waiter: Waiter,
    ) -> String {
        let request_id = self.pending.next_request_id(request_type);
        let Some(client) = self.registry.get_client(client_id) else {
            debug!(%request_type, client_id, "request for unknown client");
            waiter.finish(Err(CallError::UnknownClient(client_id.to_string())));
            return request_id;
        };

        self.pending.register(
            request_id.clone(),
            PendingEntry::new(request_type, client_id, client.connection().id(), waiter),
        );
        let request = Envelope::request(request_type, &request_id, payload);
        if !client.send(&request) {
            self.pending.fail(
                &request_id,
                CallError::SendFailed {
                    request_type,
                    client_id: client_id.to_string(),
                },
            );
            return request_id;
        }

        let after = timeout.unwrap_or(self.default_timeout);
        self.pending.schedule_timeout(&request_id, after);
        debug!(%request_type, client_id, request_id = %request_id, "request sent");
        request_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use relay_proto::ClientMetadata;
    use serde_json::json;

    use crate::connection::{Connection, Outbound};

    fn harness() -> (Dispatcher, Arc<PendingRequestTable>) {
        let pending = Arc::new(PendingRequestTable::new());
        let registry = Arc::new(Dispatcher::install(ClientRegistry::builder(), &pending).build());
        let dispatcher = Dispatcher::new(registry, Arc::clone(&pending), Duration::from_secs(10));
        (dispatcher, pending)
    }

    fn connect(dispatcher: &Dispatcher, id: &str) -> Outbound {
        let (connection, outbound) = Connection::open(None);
        dispatcher
            .registry()
            .add_client(connection, id.into(), "tok".into(), ClientMetadata::default())
            .unwrap();
        outbound
    }

    async fn next_request(outbound: &mut Outbound) -> Envelope {
        match outbound.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn unknown_client_fails_without_a_pending_entry() {
        let (dispatcher, pending) = harness();
        let outcome = dispatcher
            .call(RequestType::Search, "ghost", Map::new(), None)
            .await;
        assert_eq!(outcome, Err(CallError::UnknownClient("ghost".into())));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn send_failure_leaves_no_orphan_entry() {
        let (dispatcher, pending) = harness();
        let outbound = connect(&dispatcher, "c1");
        drop(outbound);

        let outcome = dispatcher
            .call(RequestType::Rolls, "c1", Map::new(), None)
            .await;
        assert!(matches!(outcome, Err(CallError::SendFailed { .. })));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn result_resolves_the_call() {
        let (dispatcher, pending) = harness();
        let mut outbound = connect(&dispatcher, "c1");

        let caller = dispatcher.clone();
        let call = tokio::spawn(async move {
            caller
                .call(RequestType::Entity, "c1", payload(json!({"uuid": "Actor.1"})), None)
                .await
        });

        let request = next_request(&mut outbound).await;
        assert_eq!(request.kind, "entity");
        assert_eq!(request.get("uuid"), Some(&json!("Actor.1")));
        let request_id = request.request_id.clone().unwrap();

        dispatcher.registry().handle_incoming_message(
            "c1",
            serde_json::from_value(json!({
                "type": "entity-result",
                "requestId": request_id,
                "data": {"name": "Hero"}
            }))
            .unwrap(),
        );

        let envelope = call.await.unwrap().unwrap();
        assert_eq!(envelope.get("data"), Some(&json!({"name": "Hero"})));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn remote_error_rejects_the_call() {
        let (dispatcher, _pending) = harness();
        let mut outbound = connect(&dispatcher, "c1");

        let caller = dispatcher.clone();
        let call = tokio::spawn(async move {
            caller
                .call(RequestType::ExecuteJs, "c1", Map::new(), None)
                .await
        });

        let request_id = next_request(&mut outbound).await.request_id.unwrap();
        dispatcher.registry().handle_incoming_message(
            "c1",
            serde_json::from_value(json!({
                "type": "execute-js-result",
                "requestId": request_id,
                "error": "script disabled"
            }))
            .unwrap(),
        );

        assert_eq!(
            call.await.unwrap(),
            Err(CallError::Remote("script disabled".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_result_is_dropped() {
        let (dispatcher, pending) = harness();
        let mut outbound = connect(&dispatcher, "c1");

        let caller = dispatcher.clone();
        let call = tokio::spawn(async move {
            caller.call(RequestType::Rolls, "c1", Map::new(), None).await
        });
        let request_id = next_request(&mut outbound).await.request_id.unwrap();

        match call.await.unwrap() {
            Err(CallError::TimedOut { elapsed, .. }) => {
                assert!(elapsed >= Duration::from_secs(10))
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        dispatcher.registry().handle_incoming_message(
            "c1",
            serde_json::from_value(json!({"type": "rolls-result", "requestId": request_id}))
                .unwrap(),
        );
        assert!(pending.is_empty());
        // Nothing was relayed to the group either: a handler owns the type.
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_timeout_overrides_the_default() {
        let (dispatcher, _pending) = harness();
        let _outbound = connect(&dispatcher, "c1");
        let started = tokio::time::Instant::now();

        let outcome = dispatcher
            .call(
                RequestType::Structure,
                "c1",
                Map::new(),
                Some(Duration::from_millis(250)),
            )
            .await;

        assert!(matches!(outcome, Err(CallError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
