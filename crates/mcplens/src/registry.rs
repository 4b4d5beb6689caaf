use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use mcplens_transport::{
    Inbound, InboundReceiver, StderrReceiver, Transport, TransportKind, TransportState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::factory::create_transport;
use crate::{DefaultEnvironment, Error, SessionId, TransportConfig};

/// Messages buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_FAN_OUT_CAPACITY: usize = 1024;

/// Method of the notification that carries a stdio server's stderr text.
pub const STDERR_NOTIFICATION_METHOD: &str = "notifications/stderr";

/// One inbound message, tagged with the session it came from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub message: Value,
}

/// Read-only view of the registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub default_environment: DefaultEnvironment,
}

struct SessionEntry {
    transport: Arc<Transport>,
    kind: TransportKind,
    timeout: Duration,
    forwarders: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Sessions {
    map: HashMap<SessionId, SessionEntry>,
    /// Points into `map`; the session `create_session` replaces.
    backing: Option<SessionId>,
}

struct Inner {
    default_env: Arc<DefaultEnvironment>,
    sessions: Arc<Mutex<Sessions>>,
    creation: Mutex<()>,
    fan_out: broadcast::Sender<SessionMessage>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Transports clean up on drop; forwarders would otherwise idle until their channel ends.
        if let Ok(mut sessions) = self.sessions.try_lock() {
            for entry in sessions.map.values_mut() {
                for task in entry.forwarders.drain(..) {
                    task.abort();
                }
            }
        }
    }
}

/// Live sessions keyed by [`SessionId`], with fan-out of every inbound message to subscribers.
///
/// Cloning is cheap and clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("subscribers", &self.inner.fan_out.receiver_count())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(default_env: DefaultEnvironment) -> Self {
        let (fan_out, _) = broadcast::channel(DEFAULT_FAN_OUT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                default_env: Arc::new(default_env),
                sessions: Arc::new(Mutex::new(Sessions::default())),
                creation: Mutex::new(()),
                fan_out,
            }),
        }
    }

    /// Registry whose default environment comes from the current process.
    pub fn from_process() -> Result<Self, Error> {
        Ok(Self::new(DefaultEnvironment::from_process()?))
    }

    /// Single-backing path: closes the current backing session, then opens a new one and makes
    /// it the backing session.
    ///
    /// On failure nothing is registered and the backing slot stays empty.
    pub async fn create_session(&self, config: &TransportConfig) -> Result<SessionId, Error> {
        let _creating = self.inner.creation.lock().await;

        let previous = self.inner.sessions.lock().await.backing.take();
        if let Some(previous) = previous {
            tracing::info!(session = %previous, "replacing backing session");
            self.close_session(previous).await;
        }

        let transport = create_transport(config, &self.inner.default_env).await?;
        let id = SessionId::new();
        self.register_transport(id, transport, config.timeout(), true)
            .await;
        Ok(id)
    }

    /// Multi-session path: opens a session without touching the backing slot.
    pub async fn open_session(&self, config: &TransportConfig) -> Result<SessionId, Error> {
        let transport = create_transport(config, &self.inner.default_env).await?;
        let id = SessionId::new();
        self.register_transport(id, transport, config.timeout(), false)
            .await;
        Ok(id)
    }

    /// Registers an already-started transport as a new session.
    pub async fn attach(&self, transport: Transport, timeout: Duration) -> SessionId {
        let id = SessionId::new();
        self.register_transport(id, transport, timeout, false).await;
        id
    }

    async fn register_transport(
        &self,
        id: SessionId,
        mut transport: Transport,
        timeout: Duration,
        backing: bool,
    ) {
        let kind = transport.kind();
        let inbound = transport.take_inbound();
        let stderr = transport.take_stderr();

        // Forwarders check membership under this lock, so nothing is delivered before insert.
        let mut sessions = self.inner.sessions.lock().await;
        let weak = Arc::downgrade(&self.inner.sessions);
        let mut forwarders = Vec::with_capacity(2);
        if let Some(inbound) = inbound {
            forwarders.push(tokio::spawn(forward_messages(
                id,
                inbound,
                weak.clone(),
                self.inner.fan_out.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            forwarders.push(tokio::spawn(forward_stderr(
                id,
                stderr,
                weak,
                self.inner.fan_out.clone(),
            )));
        }

        sessions.map.insert(
            id,
            SessionEntry {
                transport: Arc::new(transport),
                kind,
                timeout,
                forwarders,
            },
        );
        if backing {
            sessions.backing = Some(id);
        }
        tracing::info!(session = %id, transport = %kind, backing, "session created");
    }

    /// Sends one JSON-RPC message on the session's transport, bounded by the session timeout.
    pub async fn send_message(&self, id: SessionId, message: &Value) -> Result<(), Error> {
        let (transport, timeout) = {
            let sessions = self.inner.sessions.lock().await;
            let entry = sessions.map.get(&id).ok_or(Error::SessionNotFound(id))?;
            (entry.transport.clone(), entry.timeout)
        };

        tracing::debug!(session = %id, "sending message");
        match tokio::time::timeout(timeout, transport.send(message)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::SendFailed(format!(
                "send did not complete within {timeout:?}"
            ))),
        }
    }

    /// Closes the session. Returns false when the id is unknown (or already closed).
    pub async fn close_session(&self, id: SessionId) -> bool {
        let entry = {
            let mut sessions = self.inner.sessions.lock().await;
            if sessions.backing == Some(id) {
                sessions.backing = None;
            }
            sessions.map.remove(&id)
        };
        let Some(entry) = entry else {
            return false;
        };

        for task in &entry.forwarders {
            task.abort();
        }
        if let Err(err) = entry.transport.close().await {
            tracing::warn!(session = %id, "closing transport failed: {err}");
        }
        tracing::info!(session = %id, transport = %entry.kind, "session closed");
        true
    }

    pub async fn close_all(&self) {
        for id in self.session_ids().await {
            self.close_session(id).await;
        }
    }

    pub fn get_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_environment: self.inner.default_env.as_ref().clone(),
        }
    }

    pub fn default_environment(&self) -> &DefaultEnvironment {
        &self.inner.default_env
    }

    /// Receives every message broadcast from now on. Earlier messages are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.inner.fan_out.subscribe()
    }

    /// Calls `listener` for every message broadcast from now on, until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn on_message<F>(&self, mut listener: F) -> Subscription
    where
        F: FnMut(SessionMessage) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => listener(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "message listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Subscription { task }
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().await.map.keys().copied().collect()
    }

    pub async fn backing_session(&self) -> Option<SessionId> {
        self.inner.sessions.lock().await.backing
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.lock().await.map.contains_key(&id)
    }

    pub async fn transport_state(&self, id: SessionId) -> Option<TransportState> {
        let sessions = self.inner.sessions.lock().await;
        sessions.map.get(&id).map(|entry| entry.transport.state())
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Handle returned by [`SessionRegistry::on_message`]. Dropping it detaches the listener.
#[must_use = "dropping a Subscription detaches its listener"]
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn still_registered(sessions: &Weak<Mutex<Sessions>>, id: SessionId) -> bool {
    match sessions.upgrade() {
        Some(sessions) => sessions.lock().await.map.contains_key(&id),
        None => false,
    }
}

fn broadcast(fan_out: &broadcast::Sender<SessionMessage>, session_id: SessionId, message: Value) {
    // No subscribers is fine: messages are not retained.
    let _ = fan_out.send(SessionMessage {
        session_id,
        message,
    });
}

async fn forward_messages(
    id: SessionId,
    mut inbound: InboundReceiver,
    sessions: Weak<Mutex<Sessions>>,
    fan_out: broadcast::Sender<SessionMessage>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Message(message) => {
                if !still_registered(&sessions, id).await {
                    return;
                }
                tracing::debug!(session = %id, "inbound message");
                broadcast(&fan_out, id, message);
            }
            Inbound::Error(err) => {
                tracing::warn!(session = %id, "transport error: {err}");
            }
            Inbound::Closed(reason) => {
                tracing::warn!(session = %id, "transport closed: {reason}");
                return;
            }
        }
    }
}

async fn forward_stderr(
    id: SessionId,
    mut stderr: StderrReceiver,
    sessions: Weak<Mutex<Sessions>>,
    fan_out: broadcast::Sender<SessionMessage>,
) {
    while let Some(chunk) = stderr.recv().await {
        if !still_registered(&sessions, id).await {
            return;
        }
        broadcast(&fan_out, id, stderr_notification(&chunk));
    }
}

/// Wraps server stderr text as a JSON-RPC notification.
pub fn stderr_notification(content: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": STDERR_NOTIFICATION_METHOD,
        "params": { "content": content },
    })
}
