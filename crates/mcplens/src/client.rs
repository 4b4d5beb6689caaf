use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mcplens_transport::{Inbound, InboundReceiver, StderrReceiver, Transport};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::mcp::{
    Implementation, InitializeRequest, InitializeRequestParams, InitializeResult,
    InitializedNotification, ListToolsRequest, ListToolsResult,
};
use crate::protocol::{self, Incoming};
use crate::{Error, MCP_PROTOCOL_VERSION, McpNotification, McpRequest};

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, Error>>>>>;

/// An initialized MCP connection over one transport.
///
/// Used for short-lived exchanges (ping, tool listing) outside the session registry.
pub struct Client {
    transport: Arc<Transport>,
    pending: PendingRequests,
    next_id: AtomicU64,
    timeout: Duration,
    initialize: InitializeResult,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport.kind())
            .field("server_info", &self.initialize.server_info)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Runs the `initialize` handshake on `transport` and announces `notifications/initialized`.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn connect(
        mut transport: Transport,
        client_info: Implementation,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let Some(inbound) = transport.take_inbound() else {
            let _ = transport.close().await;
            return Err(Error::Protocol(
                "transport inbound stream was already taken".to_string(),
            ));
        };
        let stderr = transport.take_stderr();
        let transport = Arc::new(transport);
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        let mut tasks = vec![tokio::spawn(route_inbound(
            inbound,
            transport.clone(),
            pending.clone(),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(log_stderr(stderr)));
        }

        let mut client = Self {
            transport,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            initialize: InitializeResult {
                protocol_version: String::new(),
                capabilities: Value::Null,
                server_info: None,
                instructions: None,
            },
            tasks,
        };

        match client.handshake(client_info).await {
            Ok(initialize) => {
                client.initialize = initialize;
                Ok(client)
            }
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self, client_info: Implementation) -> Result<InitializeResult, Error> {
        let result = self
            .request_typed::<InitializeRequest>(InitializeRequestParams {
                protocol_version: MCP_PROTOCOL_VERSION.to_string(),
                capabilities: serde_json::json!({}),
                client_info,
            })
            .await?;
        self.notify_typed::<InitializedNotification>(None).await?;
        tracing::debug!(
            server = ?result.server_info,
            protocol_version = %result.protocol_version,
            "mcp session initialized"
        );
        Ok(result)
    }

    /// The `serverInfo` the server reported during `initialize`, if any.
    pub fn server_version(&self) -> Option<&Implementation> {
        self.initialize.server_info.as_ref()
    }

    pub fn initialize_result(&self) -> &InitializeResult {
        &self.initialize
    }

    /// Sends a request and waits for its result, bounded by the client timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingRequestGuard {
            pending: self.pending.clone(),
            id,
        };

        let exchange = async {
            self.transport
                .send(&protocol::request(id, method, params))
                .await?;
            rx.await.unwrap_or(Err(Error::SessionClosed))
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{method} did not complete within {:?}",
                self.timeout
            ))),
        }
    }

    pub async fn request_typed<R: McpRequest>(&self, params: R::Params) -> Result<R::Result, Error> {
        let params = to_params(&params)?;
        let result = self.request(R::METHOD, params).await?;
        decode(R::METHOD, result)
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let message = protocol::notification(method, params);
        match tokio::time::timeout(self.timeout, self.transport.send(&message)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout(format!(
                "{method} notification did not complete within {:?}",
                self.timeout
            ))),
        }
    }

    pub async fn notify_typed<N: McpNotification>(&self, params: N::Params) -> Result<(), Error> {
        let params = to_params(&params)?;
        self.notify(N::METHOD, params).await
    }

    /// `tools/list`, returned exactly as the server sent it.
    pub async fn list_tools(&self) -> Result<Value, Error> {
        self.request(ListToolsRequest::METHOD, None).await
    }

    pub async fn list_tools_typed(&self) -> Result<ListToolsResult, Error> {
        self.request_typed::<ListToolsRequest>(None).await
    }

    /// Closes the transport and fails every outstanding request. Idempotent.
    pub async fn close(&self) {
        if let Err(err) = self.transport.close().await {
            tracing::warn!("closing transport failed: {err}");
        }
        for task in &self.tasks {
            task.abort();
        }
        fail_pending(&self.pending);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct PendingRequestGuard {
    pending: PendingRequests,
    id: u64,
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

fn lock(
    pending: &PendingRequests,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value, Error>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fail_pending(pending: &PendingRequests) {
    let drained = std::mem::take(&mut *lock(pending));
    for (_id, tx) in drained {
        let _ = tx.send(Err(Error::SessionClosed));
    }
}

fn to_params<T: Serialize>(params: &T) -> Result<Option<Value>, Error> {
    let value = serde_json::to_value(params)?;
    Ok((!value.is_null()).then_some(value))
}

fn decode<T: DeserializeOwned>(method: &str, result: Value) -> Result<T, Error> {
    serde_json::from_value(result)
        .map_err(|err| Error::Protocol(format!("invalid {method} result: {err}")))
}

async fn route_inbound(
    mut inbound: InboundReceiver,
    transport: Arc<Transport>,
    pending: PendingRequests,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Message(Value::Array(batch)) => {
                for message in batch {
                    route_message(message, &transport, &pending).await;
                }
            }
            Inbound::Message(message) => route_message(message, &transport, &pending).await,
            Inbound::Error(err) => tracing::warn!("transport error: {err}"),
            Inbound::Closed(reason) => {
                tracing::warn!("transport closed: {reason}");
                break;
            }
        }
    }
    fail_pending(&pending);
}

async fn route_message(message: Value, transport: &Transport, pending: &PendingRequests) {
    match protocol::classify(&message) {
        Incoming::Response { id } => {
            let Some(id) = id.as_u64() else {
                tracing::debug!(?id, "ignoring response with foreign id");
                return;
            };
            let Some(tx) = lock(pending).remove(&id) else {
                tracing::debug!(id, "ignoring response to unknown request");
                return;
            };
            let _ = tx.send(response_result(&message));
        }
        Incoming::Request { id, method } => {
            let reply = if method == "ping" {
                protocol::result_response(id, serde_json::json!({}))
            } else {
                tracing::debug!(method, "rejecting unsupported server request");
                protocol::error_response(id, protocol::METHOD_NOT_FOUND, "Method not found")
            };
            if let Err(err) = transport.send(&reply).await {
                tracing::warn!(method, "replying to server request failed: {err}");
            }
        }
        Incoming::Notification { method } => tracing::debug!(method, "server notification"),
        Incoming::Invalid => tracing::warn!("ignoring malformed json-rpc message"),
    }
}

fn response_result(message: &Value) -> Result<Value, Error> {
    if let Some(error) = message.get("error") {
        return Err(Error::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: error.get("data").cloned(),
        });
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

async fn log_stderr(mut stderr: StderrReceiver) {
    while let Some(chunk) = stderr.recv().await {
        tracing::debug!(target: "mcplens::server_stderr", "{}", chunk.trim_end());
    }
}
