use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::ConnectionError;

/// What the read loop should do with one inbound websocket frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Pong,
    Close(Option<String>),
    Malformed(String),
    Ignored,
}

/// Outbound half of one peer websocket. Frames are queued on an unbounded
/// channel and written by a dedicated task (see [`Outbound::spawn_writer`]).
pub struct Connection {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<watch::Sender<bool>>,
    opened_at: Instant,
    last_pong_ms: AtomicU64,
}

/// Receiving end of a [`Connection`]'s queue, owned by the writer task.
pub struct Outbound {
    connection_id: Uuid,
    rx: mpsc::UnboundedReceiver<Message>,
    open: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub fn open(remote_addr: Option<SocketAddr>) -> (Self, Outbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (open, _) = watch::channel(true);
        let open = Arc::new(open);
        let id = Uuid::new_v4();
        let connection = Self {
            id,
            remote_addr,
            outbound: tx,
            open: Arc::clone(&open),
            opened_at: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        };
        let outbound = Outbound {
            connection_id: id,
            rx,
            open,
        };
        (connection, outbound)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow() && !self.outbound.is_closed()
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.outbound.send(Message::Text(text)).map_err(|_| {
            self.mark_closed();
            ConnectionError::Closed
        })
    }

    /// Queues a transport-level ping.
    pub fn ping(&self) -> bool {
        self.is_open() && self.outbound.send(Message::Ping(Vec::new())).is_ok()
    }

    pub fn record_pong(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_pong_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last pong, or since the connection opened if none
    /// has arrived yet.
    pub fn since_last_pong(&self) -> Duration {
        let now = self.opened_at.elapsed().as_millis() as u64;
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Queues a close frame and flips the connection to closed. Only the
    /// first call sends a frame. The frame is queued before the flag is
    /// visible as closed, so the writer always flushes it.
    pub fn close(&self, code: u16, reason: &str) {
        self.open.send_if_modified(|open| {
            if !*open {
                return false;
            }
            let _ = self.outbound.send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason.to_string()),
            })));
            *open = false;
            true
        });
    }

    pub fn mark_closed(&self) {
        self.open.send_replace(false);
    }

    /// Resolves once the connection has been marked closed.
    pub async fn closed(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }

    pub fn decode(message: Message) -> Frame {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => Frame::Text(text),
                Err(err) => Frame::Malformed(format!(
                    "binary frame of {} bytes is not UTF-8",
                    err.as_bytes().len()
                )),
            },
            Message::Pong(_) => Frame::Pong,
            Message::Close(frame) => Frame::Close(frame.map(|f| f.reason.to_string())),
            Message::Ping(_) => Frame::Ignored,
        }
    }
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Drains queued frames into `sink` until the queue closes, a write
    /// fails, or a close frame has been written. Once the connection is
    /// marked closed, frames already queued are still written.
    pub fn spawn_writer<S>(mut self, mut sink: S) -> JoinHandle<()>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        tokio::spawn(async move {
            let mut open = self.open.subscribe();
            loop {
                let message = tokio::select! {
                    biased;
                    message = self.rx.recv() => message,
                    _ = wait_closed(&mut open) => self.rx.try_recv().ok(),
                };
                let Some(message) = message else {
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!(
                        connection_id = %self.connection_id,
                        error = %err,
                        "websocket write failed"
                    );
                    break;
                }
                if closing {
                    break;
                }
            }
            self.open.send_replace(false);
            debug!(connection_id = %self.connection_id, "writer task finished");
        })
    }
}

async fn wait_closed(open: &mut watch::Receiver<bool>) {
    let _ = open.wait_for(|open| !*open).await;
}
