use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event_stream::{self, PumpEnd};
use crate::http::{self, Phase};
use crate::state::Lifecycle;
use crate::{DEFAULT_MAX_MESSAGE_BYTES, Error, Inbound, InboundReceiver, TransportState};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

#[derive(Debug, Clone)]
pub struct StreamableHttpOptions {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Resume an existing server session instead of letting the server assign one.
    pub session_id: Option<String>,
    /// Replay point for the standalone event stream.
    pub last_event_id: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub max_message_bytes: usize,
}

impl StreamableHttpOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            session_id: None,
            last_event_id: None,
            connect_timeout: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct Resumption {
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
}

impl Resumption {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records the server-assigned session id. Returns true the first time one is learned.
    fn set_session_id(&self, value: String) -> bool {
        let mut guard = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        let was_none = guard.is_none();
        *guard = Some(value);
        was_none
    }

    fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_event_id(&self, value: &str) {
        *self
            .last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(value.to_string());
    }

    fn capture(&self, resp: &reqwest::Response) -> bool {
        match http::session_header(resp, SESSION_ID_HEADER) {
            Some(id) => self.set_session_id(id),
            None => false,
        }
    }
}

/// Streamable HTTP binding: one POST per outbound message, plus a standalone GET event stream
/// for server-initiated traffic when the server offers one.
pub struct StreamableHttpTransport {
    lifecycle: Lifecycle,
    http: reqwest::Client,
    url: reqwest::Url,
    resumption: Arc<Resumption>,
    max_message_bytes: usize,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Option<InboundReceiver>,
    wake_tx: mpsc::Sender<()>,
    standalone: JoinHandle<()>,
    exchanges: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for StreamableHttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpTransport")
            .field("state", &self.lifecycle.state())
            .field("url", &http::redact_url(&self.url))
            .field("session_id", &self.resumption.session_id())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpTransport {
    /// Connects and opens the standalone event stream.
    ///
    /// A 401 fails with [`Error::Unauthorized`]. A server without a standalone stream (405 or
    /// another non-success status) still connects; the stream is retried after the server
    /// assigns a session id or accepts a message with 202.
    pub async fn connect(options: StreamableHttpOptions) -> Result<Self, Error> {
        let url = http::parse_url(&options.url)?;
        let client = http::build_http_client(&options.headers, options.connect_timeout)?;
        let lifecycle = Lifecycle::new();
        lifecycle.advance(TransportState::Starting);

        let resumption = Arc::new(Resumption::default());
        if let Some(id) = options.session_id {
            resumption.set_session_id(id);
        }
        if let Some(id) = options.last_event_id.as_deref() {
            resumption.set_last_event_id(id);
        }

        let initial = match open_standalone(&client, &url, &resumption).await {
            Ok(resp) => resp,
            Err(err) => {
                lifecycle.fail();
                return Err(err);
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let standalone = tokio::spawn(run_standalone(
            StandaloneStream {
                http: client.clone(),
                url: url.clone(),
                resumption: resumption.clone(),
                lifecycle: lifecycle.clone(),
                inbound_tx: inbound_tx.clone(),
                max_message_bytes: options.max_message_bytes,
            },
            initial,
            wake_rx,
        ));

        lifecycle.advance(TransportState::Ready);
        tracing::debug!(url = %http::redact_url(&url), "streamable http transport ready");

        Ok(Self {
            lifecycle,
            http: client,
            url,
            resumption,
            max_message_bytes: options.max_message_bytes,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            wake_tx,
            standalone,
            exchanges: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.resumption.session_id()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.resumption.last_event_id()
    }

    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        self.inbound_rx.take()
    }

    pub async fn send(&self, message: &Value) -> Result<(), Error> {
        self.lifecycle.ensure_ready()?;
        let body = serde_json::to_vec(message)?;

        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(Error::Closed),
            result = self.post(body) => result,
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), Error> {
        let mut req = self
            .http
            .post(self.url.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(id) = self.resumption.session_id() {
            req = req.header(SESSION_ID_HEADER, id);
        }

        let resp = req.send().await.map_err(|err| {
            Error::SendFailed(format!(
                "streamable http post failed: {}",
                http::redact_reqwest_error(&err)
            ))
        })?;

        let status = resp.status();
        let mut wake = status == reqwest::StatusCode::ACCEPTED;
        if self.resumption.capture(&resp) {
            wake = true;
        }
        if wake {
            let _ = self.wake_tx.try_send(());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            let _ = resp.bytes().await;
            return Ok(());
        }
        if !status.is_success() {
            return Err(http::status_error(resp, Phase::Send, "streamable http post").await);
        }

        let content_type = event_stream::content_type(&resp);
        if event_stream::is_event_stream_content_type(&content_type) {
            self.spawn_exchange(resp);
            return Ok(());
        }
        if !event_stream::is_json_content_type(&content_type) {
            return Err(Error::SendFailed(format!(
                "unexpected content-type for json response: {content_type:?}"
            )));
        }

        let body = http::read_body_limited(resp, self.max_message_bytes)
            .await
            .map_err(Error::SendFailed)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(&body).map_err(|err| {
            let preview = http::truncate_string(
                String::from_utf8_lossy(&body).into_owned(),
                http::ERROR_BODY_PREVIEW_BYTES,
            );
            Error::SendFailed(format!("http response is not valid json ({err}): {preview}"))
        })?;
        match value {
            Value::Array(batch) => {
                for message in batch {
                    let _ = self.inbound_tx.send(Inbound::Message(message));
                }
            }
            message => {
                let _ = self.inbound_tx.send(Inbound::Message(message));
            }
        }
        Ok(())
    }

    /// Pumps an event-stream reply to one POST. Ending the reply is not fatal to the transport.
    fn spawn_exchange(&self, resp: reqwest::Response) {
        let lifecycle = self.lifecycle.clone();
        let inbound_tx = self.inbound_tx.clone();
        let resumption = self.resumption.clone();
        let max_message_bytes = self.max_message_bytes;
        let task = tokio::spawn(async move {
            let mut reader = event_stream::response_reader(resp);
            let end = event_stream::pump_events(
                &mut reader,
                &lifecycle,
                &inbound_tx,
                max_message_bytes,
                |id| resumption.set_last_event_id(id),
            )
            .await;
            if let PumpEnd::Failed(err) = end {
                tracing::warn!("streamable http response stream failed: {err}");
                let _ = inbound_tx.send(Inbound::Error(format!(
                    "http response stream failed: {err}"
                )));
            }
        });

        let mut exchanges = self.exchanges.lock().unwrap_or_else(PoisonError::into_inner);
        exchanges.retain(|task| !task.is_finished());
        exchanges.push(task);
    }

    pub async fn close(&self) -> Result<(), Error> {
        if self.lifecycle.begin_close() {
            tracing::debug!("streamable http transport closed");
        }
        self.abort_tasks();
        Ok(())
    }

    fn abort_tasks(&self) {
        self.standalone.abort();
        for task in self
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

struct StandaloneStream {
    http: reqwest::Client,
    url: reqwest::Url,
    resumption: Arc<Resumption>,
    lifecycle: Lifecycle,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    max_message_bytes: usize,
}

/// Opens the standalone GET stream. `Ok(None)` means the server does not offer one right now.
async fn open_standalone(
    client: &reqwest::Client,
    url: &reqwest::Url,
    resumption: &Resumption,
) -> Result<Option<reqwest::Response>, Error> {
    let mut req = client
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(id) = resumption.session_id() {
        req = req.header(SESSION_ID_HEADER, id);
    }
    if let Some(id) = resumption.last_event_id() {
        req = req.header(LAST_EVENT_ID_HEADER, id);
    }

    let resp = req.send().await.map_err(|err| {
        Error::start(format!(
            "connect streamable http failed: {}",
            http::redact_reqwest_error(&err)
        ))
    })?;

    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(http::status_error(resp, Phase::Connect, "streamable http connect").await);
    }
    resumption.capture(&resp);
    if !status.is_success() {
        tracing::debug!(%status, "no standalone event stream offered");
        return Ok(None);
    }
    let content_type = event_stream::content_type(&resp);
    if !event_stream::is_event_stream_content_type(&content_type) {
        tracing::debug!(content_type = %content_type, "standalone GET did not return an event stream");
        return Ok(None);
    }
    Ok(Some(resp))
}

async fn run_standalone(
    stream: StandaloneStream,
    initial: Option<reqwest::Response>,
    mut wake_rx: mpsc::Receiver<()>,
) {
    let mut next = initial;
    let resp = loop {
        if let Some(resp) = next.take() {
            break resp;
        }
        tokio::select! {
            biased;
            _ = stream.lifecycle.cancelled() => return,
            woke = wake_rx.recv() => {
                if woke.is_none() {
                    return;
                }
            }
        }
        match open_standalone(&stream.http, &stream.url, &stream.resumption).await {
            Ok(resp) => next = resp,
            Err(err) => {
                tracing::warn!("standalone event stream unavailable: {err}");
                return;
            }
        }
    };

    let mut reader = event_stream::response_reader(resp);
    let resumption = stream.resumption.clone();
    let end = event_stream::pump_events(
        &mut reader,
        &stream.lifecycle,
        &stream.inbound_tx,
        stream.max_message_bytes,
        |id| resumption.set_last_event_id(id),
    )
    .await;
    match end {
        PumpEnd::Cancelled => {}
        PumpEnd::Eof => tracing::debug!("standalone event stream ended"),
        PumpEnd::Failed(err) => {
            let reason = format!("streamable http event stream failed: {err}");
            if stream.lifecycle.fail() {
                tracing::warn!("{reason}");
                let _ = stream.inbound_tx.send(Inbound::Closed(reason));
            }
        }
    }
}
