use std::collections::BTreeMap;
use std::time::Duration;

use mcplens_transport::TransportKind;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Default bound on transport start, each registry send and each client request.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Caller headers forwarded on the legacy SSE transport.
pub const SSE_HEADER_ALLOW_LIST: &[&str] = &["authorization"];

/// Caller headers forwarded on the streamable HTTP transport.
pub const STREAMABLE_HTTP_HEADER_ALLOW_LIST: &[&str] =
    &["authorization", "mcp-session-id", "last-event-id"];

/// How to reach one MCP server, as stored in profiles and passed to the registry.
///
/// `transportType` stays a plain string so that an unknown value is reported by [`validate`]
/// as a configuration error instead of failing deserialization.
///
/// [`validate`]: TransportConfig::validate
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub transport_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Shell-style argument string; quoted substrings stay one argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A validated [`TransportConfig`], one variant per transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        /// Already filtered to the allow-list, names lowercased.
        headers: BTreeMap<String, String>,
    },
    StreamableHttp {
        url: String,
        headers: BTreeMap<String, String>,
    },
}

impl TransportSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

impl TransportConfig {
    pub fn stdio(command: impl Into<String>) -> Self {
        Self {
            transport_type: TransportKind::Stdio.as_str().to_string(),
            command: Some(command.into()),
            ..Self::default()
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            transport_type: TransportKind::Sse.as_str().to_string(),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self {
            transport_type: TransportKind::StreamableHttp.as_str().to_string(),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn kind(&self) -> Result<TransportKind, Error> {
        Ok(self.transport_type.parse::<TransportKind>()?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn validate(&self) -> Result<TransportSpec, Error> {
        let kind = self.kind()?;
        if self.timeout == Some(0) {
            return Err(Error::Configuration(
                "timeout must be greater than zero".to_string(),
            ));
        }

        match kind {
            TransportKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|command| !command.is_empty())
                    .ok_or_else(|| {
                        Error::Configuration("stdio transport requires a command".to_string())
                    })?;
                let args = match self.args.as_deref() {
                    Some(args) => shell_words::split(args).map_err(|err| {
                        Error::Configuration(format!("invalid stdio args {args:?}: {err}"))
                    })?,
                    None => Vec::new(),
                };
                Ok(TransportSpec::Stdio {
                    command: command.to_string(),
                    args,
                    env: self.env.clone(),
                })
            }
            TransportKind::Sse | TransportKind::StreamableHttp => {
                let url = self
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        Error::Configuration(format!("{kind} transport requires a url"))
                    })?;
                mcplens_transport::parse_http_url(url)?;
                let url = url.to_string();
                let headers = forwarded_headers(kind, &self.headers);
                Ok(match kind {
                    TransportKind::Sse => TransportSpec::Sse { url, headers },
                    _ => TransportSpec::StreamableHttp { url, headers },
                })
            }
        }
    }
}

/// Keeps only the caller headers the transport may forward. Names are matched
/// case-insensitively and returned lowercased.
pub fn forwarded_headers(
    kind: TransportKind,
    headers: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let allow = match kind {
        TransportKind::Stdio => return BTreeMap::new(),
        TransportKind::Sse => SSE_HEADER_ALLOW_LIST,
        TransportKind::StreamableHttp => STREAMABLE_HTTP_HEADER_ALLOW_LIST,
    };
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.trim().to_ascii_lowercase();
            allow
                .contains(&name.as_str())
                .then(|| (name, value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_json() {
        let config: TransportConfig = serde_json::from_value(serde_json::json!({
            "transportType": "stdio",
            "command": "node",
            "args": "server.js --name 'my server'",
            "env": {"DEBUG": "1"},
            "timeout": 5000,
        }))
        .unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(5000));

        let spec = config.validate().unwrap();
        assert_eq!(
            spec,
            TransportSpec::Stdio {
                command: "node".to_string(),
                args: vec![
                    "server.js".to_string(),
                    "--name".to_string(),
                    "my server".to_string()
                ],
                env: BTreeMap::from([("DEBUG".to_string(), "1".to_string())]),
            }
        );
    }

    #[test]
    fn timeout_defaults_to_thirty_seconds() {
        assert_eq!(
            TransportConfig::stdio("cat").timeout(),
            Duration::from_millis(30_000)
        );
        let zero = TransportConfig::stdio("cat").with_timeout(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn unknown_transport_type_is_rejected() {
        let config = TransportConfig {
            transport_type: "websocket".to_string(),
            ..TransportConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, Error::Configuration(ref msg) if msg == "invalid transport type"),
            "{err:?}"
        );
    }

    #[test]
    fn stdio_requires_command_and_well_formed_args() {
        let empty = TransportConfig::stdio("  ");
        assert!(matches!(empty.validate(), Err(Error::Configuration(_))));

        let unterminated = TransportConfig::stdio("node").with_args("server.js 'oops");
        assert!(matches!(unterminated.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn http_transports_require_a_valid_url() {
        let missing = TransportConfig {
            transport_type: "sse".to_string(),
            ..TransportConfig::default()
        };
        assert!(matches!(missing.validate(), Err(Error::Configuration(_))));

        let invalid = TransportConfig::streamable_http("not a url");
        assert!(matches!(invalid.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn headers_are_filtered_per_transport() {
        let config = TransportConfig::streamable_http("http://127.0.0.1:1/mcp")
            .with_header("Authorization", "Bearer x")
            .with_header("Mcp-Session-Id", "abc")
            .with_header("X-Custom", "nope");

        match config.validate().unwrap() {
            TransportSpec::StreamableHttp { headers, .. } => {
                assert_eq!(
                    headers,
                    BTreeMap::from([
                        ("authorization".to_string(), "Bearer x".to_string()),
                        ("mcp-session-id".to_string(), "abc".to_string()),
                    ])
                );
            }
            other => panic!("unexpected spec {other:?}"),
        }

        let sse = forwarded_headers(TransportKind::Sse, &config.headers);
        assert_eq!(
            sse,
            BTreeMap::from([("authorization".to_string(), "Bearer x".to_string())])
        );
    }
}
