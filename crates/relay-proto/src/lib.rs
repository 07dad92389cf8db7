//! Wire vocabulary shared by the relay and the peers connected to it.
//! Kept in a dedicated crate so peer implementations can depend on the
//! envelope and request-type definitions without the server runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reserved liveness probe sent by peers; never reaches business handlers.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

const RESULT_SUFFIX: &str = "-result";

/// Close codes the relay uses when it refuses or drops a peer connection.
pub mod close_codes {
    /// `id` or `token` missing from the connection parameters.
    pub const MISSING_IDENTITY: u16 = 4001;
    /// `token` does not match the relay's shared secret.
    pub const INVALID_SECRET: u16 = 4003;
    /// No pong arrived within the keepalive window.
    pub const KEEPALIVE_TIMEOUT: u16 = 4008;
    /// Another live peer already holds the requested id.
    pub const DUPLICATE_CLIENT: u16 = 4009;
}

/// Application message envelope used in both directions:
/// `{ "type": ..., "requestId": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            fields: Map::new(),
        }
    }

    /// Builds an outbound request. `type` and `requestId` keys inside the
    /// payload are discarded so they cannot shadow the envelope header.
    pub fn request(
        request_type: RequestType,
        request_id: &str,
        mut payload: Map<String, Value>,
    ) -> Self {
        payload.remove("type");
        payload.remove("requestId");
        Self {
            kind: request_type.as_str().to_string(),
            request_id: Some(request_id.to_string()),
            fields: payload,
        }
    }

    pub fn probe() -> Self {
        Self::new(PING)
    }

    pub fn probe_reply() -> Self {
        Self::new(PONG)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn message_kind(&self) -> MessageKind {
        MessageKind::classify(&self.kind)
    }

    /// Remote-reported failure carried by a result message.
    pub fn error(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Request types the relay is able to originate against a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    Search,
    Entity,
    Structure,
    Contents,
    Create,
    Update,
    Delete,
    Rolls,
    LastRoll,
    Roll,
    ChatMessages,
    ExecuteJs,
    FileSystem,
    DownloadFile,
    UploadFile,
}

impl RequestType {
    pub const ALL: [RequestType; 15] = [
        RequestType::Search,
        RequestType::Entity,
        RequestType::Structure,
        RequestType::Contents,
        RequestType::Create,
        RequestType::Update,
        RequestType::Delete,
        RequestType::Rolls,
        RequestType::LastRoll,
        RequestType::Roll,
        RequestType::ChatMessages,
        RequestType::ExecuteJs,
        RequestType::FileSystem,
        RequestType::DownloadFile,
        RequestType::UploadFile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Search => "search",
            RequestType::Entity => "entity",
            RequestType::Structure => "structure",
            RequestType::Contents => "contents",
            RequestType::Create => "create",
            RequestType::Update => "update",
            RequestType::Delete => "delete",
            RequestType::Rolls => "rolls",
            RequestType::LastRoll => "last-roll",
            RequestType::Roll => "roll",
            RequestType::ChatMessages => "chat-messages",
            RequestType::ExecuteJs => "execute-js",
            RequestType::FileSystem => "file-system",
            RequestType::DownloadFile => "download-file",
            RequestType::UploadFile => "upload-file",
        }
    }

    /// Message type a peer answers this request with.
    pub fn result_type(self) -> String {
        format!("{}{}", self.as_str(), RESULT_SUFFIX)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown request type: {0}")]
pub struct ParseRequestTypeError(pub String);

impl FromStr for RequestType {
    type Err = ParseRequestTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == s)
            .ok_or_else(|| ParseRequestTypeError(s.to_string()))
    }
}

/// Every inbound `type` string maps to exactly one of these. `Other` is
/// not an error: the relay treats it as group chatter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Result(RequestType),
    Other(String),
}

impl MessageKind {
    pub fn classify(kind: &str) -> Self {
        match kind {
            PING => MessageKind::Ping,
            PONG => MessageKind::Pong,
            other => other
                .strip_suffix(RESULT_SUFFIX)
                .and_then(|base| base.parse().ok())
                .map(MessageKind::Result)
                .unwrap_or_else(|| MessageKind::Other(other.to_string())),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            MessageKind::Ping => PING,
            MessageKind::Pong => PONG,
            MessageKind::Result(_) => "result",
            MessageKind::Other(kind) => kind,
        }
    }
}

/// Descriptive fields a peer presents when it connects. Opaque to the
/// relay; carried for listings and logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}
