use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event_stream::{self, PumpEnd};
use crate::http::{self, Phase};
use crate::state::Lifecycle;
use crate::{DEFAULT_MAX_MESSAGE_BYTES, Error, Inbound, InboundReceiver, TransportState};

#[derive(Debug, Clone)]
pub struct SseOptions {
    pub url: String,
    /// Sent with both the event-stream GET and every POST.
    pub headers: BTreeMap<String, String>,
    pub connect_timeout: Option<Duration>,
    pub max_message_bytes: usize,
}

impl SseOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            connect_timeout: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Legacy HTTP+SSE binding: a long-lived GET event stream, and POSTs to the endpoint the server
/// announces in its first `endpoint` event.
pub struct SseTransport {
    lifecycle: Lifecycle,
    http: reqwest::Client,
    endpoint: reqwest::Url,
    inbound_rx: Option<InboundReceiver>,
    pump: JoinHandle<()>,
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("state", &self.lifecycle.state())
            .field("endpoint", &http::redact_url(&self.endpoint))
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    pub async fn connect(options: SseOptions) -> Result<Self, Error> {
        let url = http::parse_url(&options.url)?;
        let client = http::build_http_client(&options.headers, options.connect_timeout)?;
        let lifecycle = Lifecycle::new();
        lifecycle.advance(TransportState::Starting);

        match open_stream(&client, &url, &lifecycle, options.max_message_bytes).await {
            Ok((endpoint, inbound_rx, pump)) => {
                lifecycle.advance(TransportState::Ready);
                tracing::debug!(endpoint = %http::redact_url(&endpoint), "sse transport ready");
                Ok(Self {
                    lifecycle,
                    http: client,
                    endpoint,
                    inbound_rx: Some(inbound_rx),
                    pump,
                })
            }
            Err(err) => {
                lifecycle.fail();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    /// The POST endpoint announced by the server.
    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        self.inbound_rx.take()
    }

    pub async fn send(&self, message: &Value) -> Result<(), Error> {
        self.lifecycle.ensure_ready()?;
        let body = serde_json::to_vec(message)?;

        let post = async {
            let resp = self
                .http
                .post(self.endpoint.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|err| {
                    Error::SendFailed(format!(
                        "sse post failed: {}",
                        http::redact_reqwest_error(&err)
                    ))
                })?;
            if !resp.status().is_success() {
                return Err(http::status_error(resp, Phase::Send, "sse post").await);
            }
            // Replies arrive on the event stream; the POST body is only an acknowledgement.
            let _ = resp.bytes().await;
            Ok::<(), Error>(())
        };

        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(Error::Closed),
            result = post => result,
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        if self.lifecycle.begin_close() {
            tracing::debug!("sse transport closed");
        }
        self.pump.abort();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn open_stream(
    client: &reqwest::Client,
    url: &reqwest::Url,
    lifecycle: &Lifecycle,
    max_message_bytes: usize,
) -> Result<(reqwest::Url, InboundReceiver, JoinHandle<()>), Error> {
    let resp = client
        .get(url.clone())
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|err| {
            Error::start(format!(
                "connect sse failed: {}",
                http::redact_reqwest_error(&err)
            ))
        })?;
    if !resp.status().is_success() {
        return Err(http::status_error(resp, Phase::Connect, "sse connect").await);
    }
    let content_type = event_stream::content_type(&resp);
    if !event_stream::is_event_stream_content_type(&content_type) {
        return Err(Error::start(format!(
            "sse connect failed: expected content-type text/event-stream, got {content_type:?}"
        )));
    }

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut reader = event_stream::response_reader(resp);

    // Anything delivered ahead of the endpoint announcement is kept.
    let announced = loop {
        let event = match event_stream::next_event(&mut reader, max_message_bytes).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(Error::start("sse stream ended before the endpoint event")),
            Err(err) => return Err(Error::start(format!("reading sse stream failed: {err}"))),
        };
        if event.event.as_deref() == Some("endpoint") {
            break event.data;
        }
        if event.is_message() {
            if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                let _ = inbound_tx.send(Inbound::Message(value));
            }
        }
    };

    let endpoint = url
        .join(announced.trim())
        .map_err(|err| Error::start(format!("invalid sse endpoint {announced:?}: {err}")))?;
    if endpoint.origin() != url.origin() {
        return Err(Error::start(format!(
            "sse endpoint origin {} does not match connection origin {}",
            endpoint.origin().ascii_serialization(),
            url.origin().ascii_serialization()
        )));
    }

    let pump_lifecycle = lifecycle.clone();
    let pump = tokio::spawn(async move {
        let end = event_stream::pump_events(
            &mut reader,
            &pump_lifecycle,
            &inbound_tx,
            max_message_bytes,
            |_| {},
        )
        .await;
        let reason = match end {
            PumpEnd::Cancelled => return,
            PumpEnd::Eof => "sse stream closed by server".to_string(),
            PumpEnd::Failed(err) => format!("sse stream failed: {err}"),
        };
        if pump_lifecycle.fail() {
            tracing::warn!("{reason}");
            let _ = inbound_tx.send(Inbound::Closed(reason));
        }
    });

    Ok((endpoint, inbound_rx, pump))
}
