use std::io;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::state::Lifecycle;
use crate::Inbound;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// `None` means the default `message` type.
    pub(crate) event: Option<String>,
    pub(crate) data: String,
    pub(crate) id: Option<String>,
}

impl SseEvent {
    pub(crate) fn is_message(&self) -> bool {
        self.event.as_deref().is_none_or(|event| event == "message")
    }
}

fn ends_with_ignore_ascii_case(haystack: &str, suffix: &str) -> bool {
    if suffix.len() > haystack.len() {
        return false;
    }
    haystack
        .get(haystack.len() - suffix.len()..)
        .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}

fn media_type(content_type: &str) -> &str {
    content_type.trim().split(';').next().unwrap_or("").trim()
}

pub(crate) fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type(content_type).eq_ignore_ascii_case("text/event-stream")
}

pub(crate) fn is_json_content_type(content_type: &str) -> bool {
    if content_type.trim().is_empty() {
        return true;
    }
    let Some((ty, subty)) = media_type(content_type).split_once('/') else {
        return false;
    };
    ty.eq_ignore_ascii_case("application")
        && (subty.eq_ignore_ascii_case("json") || ends_with_ignore_ascii_case(subty, "+json"))
}

pub(crate) fn content_type(resp: &reqwest::Response) -> String {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn response_reader(resp: reqwest::Response) -> impl AsyncBufRead + Unpin + Send {
    let stream = resp
        .bytes_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    tokio::io::BufReader::new(StreamReader::new(stream))
}

/// Reads the next complete event. Returns `Ok(None)` at end of stream; a trailing event
/// without its blank line is discarded.
pub(crate) async fn next_event<R>(
    reader: &mut R,
    max_message_bytes: usize,
) -> Result<Option<SseEvent>, io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut event = SseEvent::default();
    let mut has_data = false;

    loop {
        let Some(line) = crate::read_line_limited(reader, max_message_bytes).await? else {
            return Ok(None);
        };

        if line.is_empty() {
            if !has_data {
                // Events without data are not dispatched, but an id still counts.
                if event.id.is_some() {
                    return Ok(Some(event));
                }
                event = SseEvent::default();
                continue;
            }
            return Ok(Some(event));
        }
        if line.first() == Some(&b':') {
            continue;
        }

        let line = String::from_utf8_lossy(&line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                if event.data.len().saturating_add(value.len()) > max_message_bytes {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "sse event too large",
                    ));
                }
                event.data.push_str(value);
                has_data = true;
            }
            // An empty type dispatches as the default `message`.
            "event" => event.event = (!value.is_empty()).then(|| value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    event.id = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
pub(crate) enum PumpEnd {
    Eof,
    Failed(io::Error),
    Cancelled,
}

/// Forwards `message` events to the inbound channel until the stream ends or the transport is
/// closed. `on_id` sees every event id so callers can remember it for resumption.
pub(crate) async fn pump_events<R, F>(
    reader: &mut R,
    lifecycle: &Lifecycle,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    max_message_bytes: usize,
    mut on_id: F,
) -> PumpEnd
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    loop {
        let next = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => return PumpEnd::Cancelled,
            next = next_event(reader, max_message_bytes) => next,
        };
        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return PumpEnd::Eof,
            Err(err) => return PumpEnd::Failed(err),
        };

        if let Some(id) = event.id.as_deref() {
            on_id(id);
        }
        if !event.is_message() || event.data.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&event.data) {
            Ok(value) => {
                tracing::trace!("sse message received");
                let _ = inbound_tx.send(Inbound::Message(value));
            }
            Err(err) => {
                tracing::warn!("skipping non-JSON sse event: {err}");
                let _ = inbound_tx.send(Inbound::Error(format!("invalid json in sse event: {err}")));
            }
        }
    }
}
