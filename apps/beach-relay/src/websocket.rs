use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures_util::StreamExt;
use metrics::counter;
use relay_proto::ClientMetadata;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Frame};
use crate::error::AdmissionError;
use crate::state::AppState;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Identity and metadata a peer presents on the upgrade request.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub id: Option<String>,
    pub token: Option<String>,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
}

impl ConnectParams {
    /// Checks presence of both identity fields and the shared secret.
    /// Returns `(id, group_key)`.
    pub fn admit(&self, shared_secret: &str) -> Result<(String, String), AdmissionError> {
        let id = self.id.as_deref().map(str::trim).unwrap_or_default();
        let token = self.token.as_deref().unwrap_or_default();
        if id.is_empty() || token.is_empty() {
            return Err(AdmissionError::MissingIdentity);
        }
        if token != shared_secret {
            return Err(AdmissionError::InvalidSecret);
        }
        Ok((id.to_string(), token.to_string()))
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, remote_addr, params, state))
}

async fn handle_socket(
    socket: WebSocket,
    remote_addr: SocketAddr,
    params: ConnectParams,
    state: AppState,
) {
    let (sink, mut stream) = socket.split();
    let (connection, outbound) = Connection::open(Some(remote_addr));
    let connection_id = connection.id();
    let mut writer = outbound.spawn_writer(sink);

    let (id, group_key) = match params.admit(&state.config.shared_secret) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(%remote_addr, error = %err, "refusing peer connection");
            counter!(
                "beach_relay_admissions_rejected_total",
                1,
                "reason" => err.reason()
            );
            connection.close(err.close_code(), &err.to_string());
            let _ = writer.await;
            return;
        }
    };

    let client = match state
        .registry
        .add_client(connection, id, group_key, params.metadata)
    {
        Ok(client) => client,
        Err(err) => {
            warn!(%remote_addr, error = %err, "refusing peer connection");
            // The registry already queued the close frame.
            let _ = writer.await;
            return;
        }
    };

    let keepalive =
        client.spawn_keepalive(state.config.keepalive_interval, state.config.keepalive_timeout);

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = client.connection().closed() => {
                debug!(client_id = %client.id(), "connection closed locally");
                break;
            }
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(client_id = %client.id(), error = %err, "websocket read failed");
                break;
            }
            None => break,
        };
        match Connection::decode(message) {
            Frame::Text(text) => client.receive(&state.registry, &text),
            Frame::Pong => client.record_pong(),
            Frame::Close(reason) => {
                debug!(client_id = %client.id(), ?reason, "peer closed websocket");
                break;
            }
            Frame::Malformed(detail) => {
                warn!(client_id = %client.id(), %detail, "dropping undecodable frame")
            }
            Frame::Ignored => {}
        }
    }

    keepalive.abort();
    client.connection().mark_closed();
    client.mark_disconnected();
    state.registry.release(&client);
    // Let the writer flush a queued close frame (keepalive timeout) first.
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        client_id = %client.id(),
        connection_id = %connection_id,
        "peer connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(id: Option<&str>, token: Option<&str>) -> ConnectParams {
        ConnectParams {
            id: id.map(str::to_string),
            token: token.map(str::to_string),
            metadata: ClientMetadata::default(),
        }
    }

    #[test]
    fn admission_checks_identity_then_secret() {
        assert_eq!(
            params(None, Some("tok")).admit("tok"),
            Err(AdmissionError::MissingIdentity)
        );
        assert_eq!(
            params(Some("  "), Some("tok")).admit("tok"),
            Err(AdmissionError::MissingIdentity)
        );
        assert_eq!(
            params(Some("c1"), Some("nope")).admit("tok"),
            Err(AdmissionError::InvalidSecret)
        );
        assert_eq!(
            params(Some("c1"), Some("tok")).admit("tok"),
            Ok(("c1".to_string(), "tok".to_string()))
        );
    }

    #[test]
    fn metadata_is_read_from_query_parameters() {
        let params: ConnectParams =
            serde_json::from_value(serde_json::json!({
                "id": "c1",
                "token": "tok",
                "worldId": "w1",
                "worldTitle": "Shattered Isles"
            }))
            .unwrap();
        assert_eq!(params.metadata.world_id.as_deref(), Some("w1"));
        assert_eq!(params.metadata.world_title.as_deref(), Some("Shattered Isles"));
    }
}
