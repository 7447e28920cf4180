/// Cross-process notification channel between the service and foreground roles.
///
/// Messages are one-way notifications addressed to a [`Destination`].  Two
/// transports implement [`MessageChannel`]:
///   - [`TcpChannel`]    Loopback TCP, one JSON message per line, answered by [`serve`].
///   - `LocalChannel`    In-process recording transport for tests.
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
/// Posts queued ahead of the sender task before new ones are refused.
const OUTBOX_CAPACITY: usize = 64;

/// Message identifiers understood by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEvent {
    TargetProcessDetected,
    ConfigValueTouched,
    DenyTarget,
    AllowTarget,
    BeginMonitoring,
    MonitorFailed,
    OpenRequest,
    Exit,
    /// Liveness probe; only ever acknowledged.
    Ping,
}

/// Address of a message listener (a loopback `host:port` for [`TcpChannel`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A one-shot request to be told about the next occurrence of `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub target: Destination,
    pub event: ChannelEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Event { event: ChannelEvent },
    Subscribe { subscription: Subscription },
}

impl Message {
    pub fn event(event: ChannelEvent) -> Self {
        Self::Event { event }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
}

pub trait MessageChannel: Send + Sync {
    /// Delivers `message` without waiting for the receiver.
    fn post(&self, dest: &Destination, message: &Message) -> Result<()>;

    /// Delivers `message` and blocks until the receiver acknowledges it.
    fn request(&self, dest: &Destination, message: &Message) -> Result<Reply>;
}

/// Receives messages arriving at a listener.
pub type MessageSink = Arc<dyn Fn(Message) + Send + Sync>;

// ── Local transport ───────────────────────────────────────────────────────────

#[cfg(test)]
pub use local::LocalChannel;


// ── TCP transport ─────────────────────────────────────────────────────────────

/// A post waiting for the sender task.
struct Outgoing {
    addr: SocketAddr,
    dest: Destination,
    line: String,
}

/// Loopback TCP client.  Each message opens a short-lived connection.
///
/// A channel built with [`TcpChannel::spawn`] hands posts to a background
/// sender task and returns at once, so a peer that is down never stalls the
/// caller.  [`request`](MessageChannel::request) always blocks for the reply.
pub struct TcpChannel {
    timeout: Duration,
    outbox: Option<mpsc::Sender<Outgoing>>,
}

impl Default for TcpChannel {
    /// Blocking client; posts are written inline.
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            outbox: None,
        }
    }
}

impl TcpChannel {
    /// Starts the sender task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(drain_outbox(rx, DEFAULT_TIMEOUT));
        Self {
            timeout: DEFAULT_TIMEOUT,
            outbox: Some(tx),
        }
    }

    fn send(&self, addr: SocketAddr, dest: &Destination, line: &str) -> Result<TcpStream> {
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .with_context(|| format!("Failed to reach {dest}"))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to write to {dest}"))?;
        Ok(stream)
    }
}

fn parse_addr(dest: &Destination) -> Result<SocketAddr> {
    dest.as_str()
        .parse()
        .with_context(|| format!("Invalid destination address: {dest}"))
}

fn encode_line(message: &Message) -> Result<String> {
    let mut line = serde_json::to_string(message).context("Failed to encode message")?;
    line.push('\n');
    Ok(line)
}

impl MessageChannel for TcpChannel {
    fn post(&self, dest: &Destination, message: &Message) -> Result<()> {
        let addr = parse_addr(dest)?;
        let line = encode_line(message)?;
        let Some(outbox) = &self.outbox else {
            return self.send(addr, dest, &line).map(drop);
        };
        outbox
            .try_send(Outgoing {
                addr,
                dest: dest.clone(),
                line,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => anyhow!("Outbox full; dropping message for {dest}"),
                TrySendError::Closed(_) => anyhow!("Sender task gone; dropping message for {dest}"),
            })
    }

    fn request(&self, dest: &Destination, message: &Message) -> Result<Reply> {
        let stream = self.send(parse_addr(dest)?, dest, &encode_line(message)?)?;
        let mut reply = String::new();
        BufReader::new(stream)
            .read_line(&mut reply)
            .with_context(|| format!("No reply from {dest}"))?;
        serde_json::from_str(reply.trim()).with_context(|| format!("Malformed reply from {dest}"))
    }
}

/// Delivers queued posts one after another, so they arrive in post order.
/// Ends once every [`TcpChannel`] holding the sender is gone.
async fn drain_outbox(mut rx: mpsc::Receiver<Outgoing>, timeout: Duration) {
    while let Some(out) = rx.recv().await {
        if let Err(e) = deliver(&out, timeout).await {
            tracing::warn!(dest = %out.dest, "Failed to deliver: {e:#}");
        }
    }
}

async fn deliver(out: &Outgoing, timeout: Duration) -> Result<()> {
    let mut stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(out.addr))
        .await
        .with_context(|| format!("Timed out reaching {}", out.dest))?
        .with_context(|| format!("Failed to reach {}", out.dest))?;
    tokio::time::timeout(timeout, stream.write_all(out.line.as_bytes()))
        .await
        .with_context(|| format!("Timed out writing to {}", out.dest))?
        .with_context(|| format!("Failed to write to {}", out.dest))
}

/// Binds a listener for [`serve`].
pub async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to listen on {address}"))
}

/// Accepts connections forever, handing each decoded message to `sink` and
/// acknowledging it with a [`Reply`] line.
pub async fn serve(listener: TcpListener, sink: MessageSink) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, "channel connection");
                tokio::spawn(handle_connection(stream, Arc::clone(&sink)));
            }
            Err(e) => tracing::warn!("Failed to accept channel connection: {e}"),
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, sink: MessageSink) {
    let (read, mut write) = stream.into_split();
    let mut lines = tokio::io::BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match serde_json::from_str::<Message>(&line) {
            Ok(message) => {
                tracing::debug!(?message, "message received");
                sink(message);
                Reply { ok: true }
            }
            Err(e) => {
                tracing::warn!("Discarding malformed message: {e}");
                Reply { ok: false }
            }
        };
        let Ok(mut out) = serde_json::to_string(&reply) else {
            break;
        };
        out.push('\n');
        // Fire-and-forget senders close before reading; that is not an error.
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}
