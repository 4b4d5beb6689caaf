//! `mcplens` manages client sessions to MCP servers.
//!
//! It provides:
//! - `TransportConfig` / `create_transport`: validate a connection description and start a
//!   stdio, SSE or streamable-HTTP transport for it.
//! - `SessionRegistry`: named live sessions, message routing and a fan-out of every inbound
//!   message tagged with its session id.
//! - `ping` / `list_tools`: one-shot exchanges that open and close their own transport.
//! - `JsonFileProfileStore`: saved connection profiles.
//! - `JsonFileSettingsStore`: the one stored API credential.
//!
//! ## Environment
//!
//! Spawned stdio servers do not inherit the whole parent environment. They get a small
//! allow-list of inherited variables (`DefaultEnvironment`), optionally extended by the JSON
//! object in `MCP_ENV_VARS`, overlaid with the variables from the connection itself.
//!
//! ## Non-goals
//!
//! - Implementing an MCP server
//! - Interpreting the messages relayed through a session
//! - Automatic reconnect

mod client;
mod config;
mod environment;
mod error;
mod executable;
mod factory;
pub mod mcp;
mod probe;
mod profiles;
mod protocol;
mod registry;
mod session_id;
mod settings;

pub use client::Client;
pub use config::{
    DEFAULT_TIMEOUT_MS, SSE_HEADER_ALLOW_LIST, STREAMABLE_HTTP_HEADER_ALLOW_LIST, TransportConfig,
    TransportSpec, forwarded_headers,
};
pub use environment::{DefaultEnvironment, ENV_OVERRIDES_VAR};
pub use error::Error;
pub use executable::{ResolvedCommand, resolve_executable};
pub use factory::create_transport;
pub use mcplens_transport::{Inbound, Transport, TransportKind, TransportState};
pub use probe::{PingOutcome, list_tools, list_tools_transport, ping, ping_transport};
pub use profiles::{JsonFileProfileStore, NewServerProfile, ProfileStore, ServerProfile};
pub use protocol::{MCP_PROTOCOL_VERSION, McpNotification, McpRequest};
pub use registry::{
    DEFAULT_FAN_OUT_CAPACITY, RegistryConfig, STDERR_NOTIFICATION_METHOD, SessionMessage,
    SessionRegistry, Subscription, stderr_notification,
};
pub use session_id::SessionId;
pub use settings::{JsonFileSettingsStore, SettingsStore};
