//! `mcplens-transport` moves JSON-RPC messages between an MCP client and a tool server.
//!
//! Three transports are provided behind the single [`Transport`] type:
//! - [`StdioTransport`]: a spawned child process speaking newline-delimited JSON on
//!   stdin/stdout, with stderr captured separately as diagnostic text.
//! - [`SseTransport`]: the legacy HTTP+SSE binding (a GET event stream plus a POST endpoint
//!   announced by the server).
//! - [`StreamableHttpTransport`]: the streamable HTTP binding (POST per message, answered with
//!   JSON or an event stream, plus an optional standalone GET stream).
//!
//! Every transport follows the same lifecycle (see [`TransportState`]): construction starts it,
//! `send` is only valid while it is ready, and `close` ends delivery and releases the process or
//! connection. Inbound traffic is delivered through an unbounded channel taken once with
//! [`Transport::take_inbound`].

mod event_stream;
mod http;
mod sse;
mod state;
mod stdio;
mod streamable_http;

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::str::FromStr;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

pub use http::parse_url as parse_http_url;
pub use sse::{SseOptions, SseTransport};
pub use state::TransportState;
pub use stdio::{DEFAULT_READY_WINDOW, StdioOptions, StdioTransport};
pub use streamable_http::{StreamableHttpOptions, StreamableHttpTransport};

/// Upper bound for a single inbound line or event payload.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid transport configuration: {0}")]
    Configuration(String),
    #[error("transport failed to start: {message}")]
    Start {
        message: String,
        exit_status: Option<ExitStatus>,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn start(message: impl Into<String>) -> Self {
        Self::Start {
            message: message.into(),
            exit_status: None,
        }
    }
}

/// Something a transport received from (or learned about) its server.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A decoded JSON-RPC message (request, response, notification or batch).
    Message(Value),
    /// A non-fatal problem, such as an unparsable line or event payload.
    Error(String),
    /// The inbound stream ended; nothing else will arrive.
    Closed(String),
}

pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;
pub type StderrReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamable-http" => Ok(Self::StreamableHttp),
            _ => Err(Error::Configuration("invalid transport type".to_string())),
        }
    }
}

#[derive(Debug)]
pub enum Transport {
    Stdio(StdioTransport),
    Sse(SseTransport),
    StreamableHttp(StreamableHttpTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::Sse(_) => TransportKind::Sse,
            Self::StreamableHttp(_) => TransportKind::StreamableHttp,
        }
    }

    pub fn state(&self) -> TransportState {
        match self {
            Self::Stdio(t) => t.state(),
            Self::Sse(t) => t.state(),
            Self::StreamableHttp(t) => t.state(),
        }
    }

    /// Takes the inbound message stream. Returns `None` once taken.
    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        match self {
            Self::Stdio(t) => t.take_inbound(),
            Self::Sse(t) => t.take_inbound(),
            Self::StreamableHttp(t) => t.take_inbound(),
        }
    }

    /// Takes the diagnostic (stderr) text stream. Only spawned stdio transports have one.
    pub fn take_stderr(&mut self) -> Option<StderrReceiver> {
        match self {
            Self::Stdio(t) => t.take_stderr(),
            Self::Sse(_) | Self::StreamableHttp(_) => None,
        }
    }

    pub async fn send(&self, message: &Value) -> Result<(), Error> {
        match self {
            Self::Stdio(t) => t.send(message).await,
            Self::Sse(t) => t.send(message).await,
            Self::StreamableHttp(t) => t.send(message).await,
        }
    }

    /// Closes the transport. In-flight sends resolve with [`Error::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        match self {
            Self::Stdio(t) => t.close().await,
            Self::Sse(t) => t.close().await,
            Self::StreamableHttp(t) => t.close().await,
        }
    }
}

impl From<StdioTransport> for Transport {
    fn from(value: StdioTransport) -> Self {
        Self::Stdio(value)
    }
}

impl From<SseTransport> for Transport {
    fn from(value: SseTransport) -> Self {
        Self::Sse(value)
    }
}

impl From<StreamableHttpTransport> for Transport {
    fn from(value: StreamableHttpTransport) -> Self {
        Self::StreamableHttp(value)
    }
}

/// Reads one `\n`-terminated line (without the terminator or a trailing `\r`).
///
/// Returns `Ok(None)` at EOF. A line longer than `max_bytes` is an `InvalidData` error.
pub(crate) async fn read_line_limited<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, io::Error>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = match newline {
            Some(pos) => &available[..pos],
            None => available,
        };
        if line.len().saturating_add(chunk.len()) > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds {max_bytes} bytes"),
            ));
        }
        line.extend_from_slice(chunk);

        let consumed = newline.map_or(available.len(), |pos| pos + 1);
        reader.consume(consumed);
        if newline.is_some() {
            break;
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}
