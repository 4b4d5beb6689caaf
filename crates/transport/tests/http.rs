use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mcplens_transport::{
    Error, Inbound, InboundReceiver, SseOptions, SseTransport, StreamableHttpOptions,
    StreamableHttpTransport, TransportState,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn read_request(socket: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::<u8>::new();
    let header_end = loop {
        let mut tmp = [0u8; 1024];
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            break pos;
        }
    };

    let text = std::str::from_utf8(&buf[..header_end]).ok()?;
    let mut lines = text.split("\r\n");
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let total = header_end + 4 + content_length;
    while buf.len() < total {
        let mut tmp = vec![0u8; total - buf.len()];
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let body = buf[header_end + 4..total].to_vec();
    Some(Request {
        method,
        path,
        headers,
        body,
    })
}

/// Serves one request per connection with `handler`.
async fn serve<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request, TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut socket).await {
                    handler(request, socket).await;
                }
            });
        }
    });
    addr
}

async fn respond(mut socket: TcpStream, status: &str, headers: &[(&str, &str)], body: &[u8]) {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    let _ = socket.write_all(out.as_bytes()).await;
    let _ = socket.write_all(body).await;
    let _ = socket.flush().await;
}

async fn start_event_stream(socket: &mut TcpStream) {
    let _ = socket
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        )
        .await;
    let _ = socket.flush().await;
}

async fn hold_open(mut socket: TcpStream) {
    let mut drain = [0u8; 1024];
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(n) = socket.read(&mut drain).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

async fn recv(rx: &mut InboundReceiver) -> Inbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("inbound timed out")
        .expect("inbound channel closed")
}

#[tokio::test]
async fn sse_401_carries_server_text() {
    let addr = serve(|_req, socket| async move {
        respond(socket, "401 Unauthorized", &[], b"invalid token\n").await;
    })
    .await;

    let err = SseTransport::connect(SseOptions::new(format!("http://{addr}/sse")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(ref text) if text == "invalid token"), "{err:?}");
}

#[tokio::test]
async fn sse_401_without_body_uses_status_reason() {
    let addr = serve(|_req, socket| async move {
        respond(socket, "401 Unauthorized", &[], b"").await;
    })
    .await;

    let err = SseTransport::connect(SseOptions::new(format!("http://{addr}/sse")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(ref text) if text == "Unauthorized"), "{err:?}");
}

#[tokio::test]
async fn sse_non_success_status_is_a_start_error() {
    let addr = serve(|_req, socket| async move {
        respond(socket, "500 Internal Server Error", &[], b"boom").await;
    })
    .await;

    let err = SseTransport::connect(SseOptions::new(format!("http://{addr}/sse")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Start { .. }), "{err:?}");
}

#[tokio::test]
async fn sse_posts_to_announced_endpoint_and_streams_replies() {
    #[derive(Default)]
    struct State {
        posted: Mutex<Vec<Request>>,
        posted_notify: Notify,
    }
    let state = Arc::new(State::default());

    let server_state = state.clone();
    let addr = serve(move |req, mut socket| {
        let state = server_state.clone();
        async move {
            match (req.method.as_str(), req.path.as_str()) {
                ("GET", "/sse") => {
                    start_event_stream(&mut socket).await;
                    let _ = socket
                        .write_all(b"event: endpoint\ndata: /messages?sessionId=abc\n\n")
                        .await;
                    let _ = socket.flush().await;

                    let posted = loop {
                        let notified = state.posted_notify.notified();
                        if let Some(req) = state.posted.lock().await.first().cloned() {
                            break req;
                        }
                        notified.await;
                    };
                    let request: serde_json::Value = serde_json::from_slice(&posted.body).unwrap();
                    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
                    let _ = socket
                        .write_all(format!("event: message\ndata: {reply}\n\n").as_bytes())
                        .await;
                    let _ = socket.flush().await;
                    hold_open(socket).await;
                }
                ("POST", "/messages?sessionId=abc") => {
                    state.posted.lock().await.push(req);
                    state.posted_notify.notify_waiters();
                    respond(socket, "202 Accepted", &[], b"").await;
                }
                _ => respond(socket, "404 Not Found", &[], b"").await,
            }
        }
    })
    .await;

    let options =
        SseOptions::new(format!("http://{addr}/sse")).with_header("authorization", "Bearer t0k");
    let mut transport = SseTransport::connect(options).await.unwrap();
    assert_eq!(transport.state(), TransportState::Ready);
    assert_eq!(transport.endpoint().path(), "/messages");
    let mut inbound = transport.take_inbound().unwrap();

    transport
        .send(&json!({"jsonrpc": "2.0", "id": 7, "method": "ping"}))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut inbound).await,
        Inbound::Message(json!({"jsonrpc": "2.0", "id": 7, "result": {}}))
    );

    let posted = state.posted.lock().await.clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].header("authorization"), Some("Bearer t0k"));

    transport.close().await.unwrap();
    assert!(matches!(
        transport.send(&json!({})).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn sse_rejects_cross_origin_endpoint() {
    let addr = serve(|_req, mut socket| async move {
        start_event_stream(&mut socket).await;
        let _ = socket
            .write_all(b"event: endpoint\ndata: http://elsewhere.invalid/messages\n\n")
            .await;
        hold_open(socket).await;
    })
    .await;

    let err = SseTransport::connect(SseOptions::new(format!("http://{addr}/sse")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Start { ref message, .. } if message.contains("origin")));
}

#[tokio::test]
async fn refused_connection_is_a_start_error() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = SseTransport::connect(SseOptions::new(format!("http://{addr}/sse")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Start { .. }), "{err:?}");

    let err = StreamableHttpTransport::connect(StreamableHttpOptions::new(format!(
        "http://{addr}/mcp"
    )))
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Start { .. }), "{err:?}");
}

#[tokio::test]
async fn streamable_http_401_is_unauthorized() {
    let addr = serve(|_req, socket| async move {
        respond(socket, "401 Unauthorized", &[], b"missing bearer token").await;
    })
    .await;

    let err = StreamableHttpTransport::connect(StreamableHttpOptions::new(format!(
        "http://{addr}/mcp"
    )))
    .await
    .unwrap_err();
    assert!(
        matches!(err, Error::Unauthorized(ref text) if text == "missing bearer token"),
        "{err:?}"
    );
}

#[tokio::test]
async fn streamable_http_json_replies_and_session_tracking() {
    let posted = Arc::new(Mutex::new(Vec::<Request>::new()));

    let server_posted = posted.clone();
    let addr = serve(move |req, socket| {
        let posted = server_posted.clone();
        async move {
            match req.method.as_str() {
                "GET" => respond(socket, "405 Method Not Allowed", &[], b"").await,
                "POST" => {
                    let message: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                    posted.lock().await.push(req);
                    match message.get("id") {
                        Some(id) if message["method"] == "batch" => {
                            let body = json!([
                                {"jsonrpc": "2.0", "method": "notifications/progress"},
                                {"jsonrpc": "2.0", "id": id, "result": {"n": 2}},
                            ]);
                            respond(
                                socket,
                                "200 OK",
                                &[("Content-Type", "application/json")],
                                body.to_string().as_bytes(),
                            )
                            .await;
                        }
                        Some(id) => {
                            let body = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                            respond(
                                socket,
                                "200 OK",
                                &[
                                    ("Content-Type", "application/json"),
                                    ("Mcp-Session-Id", "session-1"),
                                ],
                                body.to_string().as_bytes(),
                            )
                            .await;
                        }
                        None => respond(socket, "202 Accepted", &[], b"").await,
                    }
                }
                _ => respond(socket, "404 Not Found", &[], b"").await,
            }
        }
    })
    .await;

    let mut transport =
        StreamableHttpTransport::connect(StreamableHttpOptions::new(format!("http://{addr}/mcp")))
            .await
            .unwrap();
    let mut inbound = transport.take_inbound().unwrap();
    assert_eq!(transport.session_id(), None);

    transport
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut inbound).await,
        Inbound::Message(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
    );
    assert_eq!(transport.session_id().as_deref(), Some("session-1"));

    transport
        .send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await
        .unwrap();
    transport
        .send(&json!({"jsonrpc": "2.0", "id": 2, "method": "batch"}))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut inbound).await,
        Inbound::Message(json!({"jsonrpc": "2.0", "method": "notifications/progress"}))
    );
    assert_eq!(
        recv(&mut inbound).await,
        Inbound::Message(json!({"jsonrpc": "2.0", "id": 2, "result": {"n": 2}}))
    );

    let posted = posted.lock().await.clone();
    assert_eq!(posted.len(), 3);
    assert_eq!(posted[0].header("mcp-session-id"), None);
    assert_eq!(posted[1].header("mcp-session-id"), Some("session-1"));
    assert_eq!(posted[2].header("mcp-session-id"), Some("session-1"));
    assert!(
        posted[0]
            .header("accept")
            .is_some_and(|accept| accept.contains("text/event-stream"))
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn streamable_http_event_stream_reply_tracks_last_event_id() {
    let addr = serve(|req, mut socket| async move {
        match req.method.as_str() {
            "GET" => respond(socket, "405 Method Not Allowed", &[], b"").await,
            _ => {
                start_event_stream(&mut socket).await;
                let reply = json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}});
                let _ = socket
                    .write_all(format!("id: evt-5\ndata: {reply}\n\n").as_bytes())
                    .await;
                let _ = socket.flush().await;
            }
        }
    })
    .await;

    let mut transport =
        StreamableHttpTransport::connect(StreamableHttpOptions::new(format!("http://{addr}/mcp")))
            .await
            .unwrap();
    let mut inbound = transport.take_inbound().unwrap();

    transport
        .send(&json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut inbound).await,
        Inbound::Message(json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}}))
    );
    assert_eq!(transport.last_event_id().as_deref(), Some("evt-5"));
    // The reply stream ending does not end the transport.
    assert_eq!(transport.state(), TransportState::Ready);

    transport.close().await.unwrap();
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test]
async fn streamable_http_post_error_is_send_failed() {
    let addr = serve(|req, socket| async move {
        match req.method.as_str() {
            "GET" => respond(socket, "405 Method Not Allowed", &[], b"").await,
            _ => respond(socket, "500 Internal Server Error", &[], b"kaput").await,
        }
    })
    .await;

    let transport =
        StreamableHttpTransport::connect(StreamableHttpOptions::new(format!("http://{addr}/mcp")))
            .await
            .unwrap();
    let err = transport
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::SendFailed(ref message) if message.contains("500") && message.contains("kaput")),
        "{err:?}"
    );
    transport.close().await.unwrap();
}
