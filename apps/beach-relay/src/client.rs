use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use relay_proto::{close_codes, ClientMetadata, Envelope};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::registry::ClientRegistry;

/// One connected peer: identity, liveness and the connection it speaks on.
pub struct Client {
    id: String,
    group_key: String,
    metadata: ClientMetadata,
    connection: Connection,
    connected_at: DateTime<Utc>,
    last_seen_ms: AtomicU64,
    disconnected: AtomicBool,
}

/// Listing view of a [`Client`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl Client {
    pub fn new(
        id: String,
        group_key: String,
        metadata: ClientMetadata,
        connection: Connection,
    ) -> Self {
        Self {
            id,
            group_key,
            metadata,
            connection,
            connected_at: Utc::now(),
            last_seen_ms: AtomicU64::new(now_millis()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn metadata(&self) -> &ClientMetadata {
        &self.metadata
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Transport is open and nobody has marked this client disconnected.
    pub fn is_alive(&self) -> bool {
        self.connection.is_open() && !self.disconnected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.connection.record_pong();
        self.touch();
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        let millis = self.last_seen_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis as i64).unwrap_or(self.connected_at)
    }

    /// Serializes and queues `message`. Never panics; a failed write marks
    /// the client disconnected so later sends fail fast.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        if !self.is_alive() {
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(client_id = %self.id, error = %err, "failed to encode outbound message");
                return false;
            }
        };
        match self.connection.send_text(text) {
            Ok(()) => true,
            Err(err) => {
                debug!(client_id = %self.id, error = %err, "send failed; marking client disconnected");
                self.mark_disconnected();
                false
            }
        }
    }

    /// Decodes one inbound text payload and hands it to the registry's
    /// router. Malformed payloads are logged and dropped; the connection
    /// stays up.
    pub fn receive(self: &Arc<Self>, registry: &ClientRegistry, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    client_id = %self.id,
                    error = %err,
                    "dropping malformed message"
                );
                return;
            }
        };

        registry.route(self, envelope);
    }

    /// Pings the peer every `every`; closes the connection once no pong
    /// has been seen for `timeout`.
    pub fn spawn_keepalive(self: &Arc<Self>, every: Duration, timeout: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.is_alive() {
                    break;
                }
                if client.connection.since_last_pong() > timeout {
                    warn!(
                        client_id = %client.id,
                        silent_for_ms = client.connection.since_last_pong().as_millis() as u64,
                        "no pong within keepalive window; closing connection"
                    );
                    client
                        .connection
                        .close(close_codes::KEEPALIVE_TIMEOUT, "keepalive timeout");
                    break;
                }
                client.connection.ping();
            }
        })
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            last_seen_at: self.last_seen_at(),
            remote_addr: self.connection.remote_addr().map(|addr| addr.to_string()),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
