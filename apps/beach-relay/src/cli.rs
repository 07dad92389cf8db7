use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use relay_proto::{Envelope, RequestType};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "beach-relay", version)]
#[command(about = "Request/response relay for long-lived peer connections")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server (default when no command is given)
    Serve(ServeArgs),
    /// Connect as a demo peer that echoes every request back as its result
    Peer(PeerArgs),
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// Relay websocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:3010/relay")]
    pub url: String,

    /// Client id to register under
    #[arg(long)]
    pub id: String,

    #[arg(long, env = "BEACH_RELAY_SHARED_SECRET", hide_env_values = true)]
    pub token: String,

    #[arg(long)]
    pub world_title: Option<String>,

    /// Seconds between liveness probes
    #[arg(long, default_value_t = 30)]
    pub probe_interval_secs: u64,
}

impl PeerArgs {
    fn endpoint(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).with_context(|| format!("invalid relay url: {}", self.url))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &self.id);
            query.append_pair("token", &self.token);
            if let Some(title) = &self.world_title {
                query.append_pair("worldTitle", title);
            }
        }
        Ok(url)
    }
}

/// Builds the `{type}-result` a demo peer sends back for `request`, or
/// `None` when `request` is not something the relay originates.
pub fn echo_result(request: &Envelope) -> Option<Envelope> {
    let request_type: RequestType = request.kind.parse().ok()?;
    let request_id = request.request_id.clone()?;
    let mut result = Envelope::new(request_type.result_type())
        .with_field("data", Value::Object(request.fields.clone()));
    result.request_id = Some(request_id);
    Some(result)
}

pub async fn run_peer(args: PeerArgs) -> Result<()> {
    let endpoint = args.endpoint()?;
    debug!(url = %args.url, id = %args.id, "connecting to relay");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(endpoint.as_str())).await
    {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow!("connection to {} failed: {}", args.url, e)),
        Err(_) => return Err(anyhow!("timed out connecting to {}", args.url)),
    };
    info!(id = %args.id, "connected to relay");

    let (mut write, mut read) = ws_stream.split();
    let probe_text = serde_json::to_string(&Envelope::probe())?;
    let mut probe = tokio::time::interval(Duration::from_secs(args.probe_interval_secs.max(1)));
    probe.tick().await;

    loop {
        tokio::select! {
            _ = probe.tick() => {
                write.send(Message::Text(probe_text.clone().into())).await?;
            }
            message = read.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                };
                match message {
                    Message::Text(text) => {
                        let request: Envelope = match serde_json::from_str(text.as_str()) {
                            Ok(request) => request,
                            Err(err) => {
                                warn!(error = %err, "relay sent malformed message");
                                continue;
                            }
                        };
                        match echo_result(&request) {
                            Some(result) => {
                                info!(request_type = %request.kind, "answering request");
                                let reply = serde_json::to_string(&result)?;
                                write.send(Message::Text(reply.into())).await?;
                            }
                            None => info!(message_type = %request.kind, "relay message: {}", text.as_str()),
                        }
                    }
                    Message::Close(frame) => {
                        match frame {
                            Some(frame) => info!(
                                code = u16::from(frame.code),
                                reason = %frame.reason,
                                "relay closed the connection"
                            ),
                            None => info!("relay closed the connection"),
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
