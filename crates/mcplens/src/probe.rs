//! One-shot operations that open their own transport, do one exchange and close it again.
//!
//! Nothing here touches the [`SessionRegistry`](crate::SessionRegistry).

use std::time::Duration;

use mcplens_transport::{Transport, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::Implementation;
use crate::{Client, DefaultEnvironment, Error, TransportConfig, create_transport};

/// Result of [`ping`]. Serializes as `{"message":"pong","serverInfo":{...}}` or
/// `{"error":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PingOutcome {
    Pong {
        message: String,
        #[serde(rename = "serverInfo")]
        server_info: Implementation,
    },
    Failed {
        error: String,
    },
}

impl PingOutcome {
    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Pong { .. })
    }
}

/// Connects, reads the server's version and disconnects. Never fails: every error becomes
/// [`PingOutcome::Failed`].
pub async fn ping(config: &TransportConfig, default_env: &DefaultEnvironment) -> PingOutcome {
    match create_transport(config, default_env).await {
        Ok(transport) => ping_transport(transport, config.timeout()).await,
        Err(err) => failed(err),
    }
}

/// [`ping`] over a transport that is already started. The transport is always closed.
pub async fn ping_transport(transport: Transport, timeout: Duration) -> PingOutcome {
    match server_version(transport, timeout).await {
        Ok(server_info) => PingOutcome::Pong {
            message: "pong".to_string(),
            server_info,
        },
        Err(err) => failed(err),
    }
}

fn failed(err: Error) -> PingOutcome {
    tracing::debug!("ping failed: {err}");
    PingOutcome::Failed {
        error: err.to_string(),
    }
}

async fn server_version(transport: Transport, timeout: Duration) -> Result<Implementation, Error> {
    let client = Client::connect(transport, Implementation::mcplens(), timeout).await?;
    let server_info = client.server_version().cloned();
    client.close().await;
    server_info.ok_or_else(|| {
        Error::PingFailed("server did not report version information".to_string())
    })
}

/// Fetches the tool catalog of a stdio server, returned verbatim.
pub async fn list_tools(
    config: &TransportConfig,
    default_env: &DefaultEnvironment,
) -> Result<Value, Error> {
    if config.kind()? != TransportKind::Stdio {
        return Err(Error::Configuration(
            "tool listing is only supported for stdio servers".to_string(),
        ));
    }
    let transport = create_transport(config, default_env).await?;
    list_tools_transport(transport, config.timeout()).await
}

/// [`list_tools`] over a transport that is already started. The transport is always closed.
pub async fn list_tools_transport(transport: Transport, timeout: Duration) -> Result<Value, Error> {
    let client = Client::connect(transport, Implementation::mcplens(), timeout).await?;
    let result = client.list_tools().await;
    client.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_serialize_to_the_wire_shapes() {
        let pong = PingOutcome::Pong {
            message: "pong".to_string(),
            server_info: Implementation::new("demo", "0.1.0"),
        };
        assert_eq!(
            serde_json::to_value(&pong).unwrap(),
            serde_json::json!({"message": "pong", "serverInfo": {"name": "demo", "version": "0.1.0"}})
        );

        let failed = PingOutcome::Failed {
            error: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"error": "boom"})
        );
        assert!(!failed.is_pong());
    }

    #[tokio::test]
    async fn list_tools_rejects_http_transports() {
        let config = TransportConfig::sse("http://127.0.0.1:9/sse");
        let err = list_tools(&config, &DefaultEnvironment::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn ping_reports_configuration_errors_as_failures() {
        let config = TransportConfig::stdio("");
        let outcome = ping(&config, &DefaultEnvironment::default()).await;
        assert!(matches!(outcome, PingOutcome::Failed { ref error } if error.contains("command")));
    }
}
