use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;

use crate::Error;

/// Bytes of a failed response body kept for error messages.
pub(crate) const ERROR_BODY_PREVIEW_BYTES: usize = 4 * 1024;

pub(crate) fn build_http_client(
    headers: &BTreeMap<String, String>,
    connect_timeout: Option<Duration>,
) -> Result<reqwest::Client, Error> {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| Error::Configuration(format!("invalid http header name: {key}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| Error::Configuration(format!("invalid http header value: {key}")))?;
        map.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        // Avoid automatic proxy environment variable loading.
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .default_headers(map);
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
        .build()
        .map_err(|err| Error::Configuration(format!("build http client failed: {err}")))
}

/// Parses an absolute `http`/`https` url.
pub fn parse_url(url: &str) -> Result<reqwest::Url, Error> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| Error::Configuration(format!("invalid url {url:?}: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(Error::Configuration(format!(
            "unsupported url scheme {other:?}"
        ))),
    }
}

/// Which phase a failed response belongs to; decides the error variant for non-401 statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connect,
    Send,
}

/// Turns a non-success response into the matching typed error.
///
/// 401 becomes [`Error::Unauthorized`] carrying the server's text (or the canonical reason when
/// the body is empty).
pub(crate) async fn status_error(resp: reqwest::Response, phase: Phase, what: &str) -> Error {
    let status = resp.status();
    let body = read_body_preview(resp, ERROR_BODY_PREVIEW_BYTES).await;

    if status == reqwest::StatusCode::UNAUTHORIZED {
        let text = body
            .map(|body| body.trim().to_string())
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unauthorized").to_string());
        return Error::Unauthorized(text);
    }

    let mut message = format!("{what} failed: http status {status}");
    if let Some(body) = body {
        let body = body.trim();
        if !body.is_empty() {
            message.push_str(": ");
            message.push_str(body);
        }
    }
    match phase {
        Phase::Connect => Error::start(message),
        Phase::Send => Error::SendFailed(message),
    }
}

pub(crate) fn session_header(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub(crate) async fn read_body_limited(
    resp: reqwest::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| redact_reqwest_error(&err))?;
        if out.len().saturating_add(chunk.len()) > max_bytes {
            return Err(format!("http response exceeds {max_bytes} bytes"));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

async fn read_body_preview(resp: reqwest::Response, max_bytes: usize) -> Option<String> {
    let mut out = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.ok()?;
        let remaining = max_bytes.saturating_add(1).saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        let take = remaining.min(chunk.len());
        out.extend_from_slice(&chunk[..take]);
        if out.len() >= max_bytes {
            break;
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(truncate_string(
        String::from_utf8_lossy(&out).into_owned(),
        max_bytes,
    ))
}

/// Error text with credentials, path and query stripped from any embedded url.
pub(crate) fn redact_reqwest_error(err: &reqwest::Error) -> String {
    let msg = err.to_string();
    let Some(url) = err.url() else {
        return msg;
    };
    msg.replace(url.as_str(), &redact_url(url))
}

pub(crate) fn redact_url(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

pub(crate) fn truncate_string(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
