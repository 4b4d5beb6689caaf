use std::time::Duration;

use mcplens_transport::{
    SseOptions, SseTransport, StdioOptions, StdioTransport, StreamableHttpOptions,
    StreamableHttpTransport, Transport,
};

use crate::config::TransportSpec;
use crate::executable::resolve_executable;
use crate::{DefaultEnvironment, Error, TransportConfig};

/// Builds and starts the transport described by `config`.
///
/// The returned transport is ready to send. Configuration problems surface before anything is
/// spawned or connected; the start itself is bounded by the config timeout.
pub async fn create_transport(
    config: &TransportConfig,
    default_env: &DefaultEnvironment,
) -> Result<Transport, Error> {
    let spec = config.validate()?;
    let kind = spec.kind();
    let timeout = config.timeout();

    match tokio::time::timeout(timeout, start(spec, default_env, timeout)).await {
        Ok(Ok(transport)) => {
            tracing::info!(transport = %kind, "transport started");
            Ok(transport)
        }
        Ok(Err(err)) => {
            tracing::warn!(transport = %kind, "transport failed to start: {err}");
            Err(err)
        }
        Err(_) => Err(Error::TransportStart {
            message: format!("{kind} transport did not start within {timeout:?}"),
            exit_status: None,
        }),
    }
}

async fn start(
    spec: TransportSpec,
    default_env: &DefaultEnvironment,
    timeout: Duration,
) -> Result<Transport, Error> {
    match spec {
        TransportSpec::Stdio { command, args, env } => {
            let env = default_env.merged_with(&env);
            let resolved =
                resolve_executable(&command, &args, env.get("PATH").map(String::as_str)).await;
            tracing::debug!(
                command = %command,
                program = ?resolved.program,
                "spawning stdio server"
            );

            let mut options = StdioOptions::new(resolved.program).with_args(resolved.args);
            options.env = env;
            Ok(StdioTransport::spawn(options).await?.into())
        }
        TransportSpec::Sse { url, headers } => {
            tracing::debug!(header_names = ?headers.keys().collect::<Vec<_>>(), "connecting sse");
            let mut options = SseOptions::new(url);
            options.headers = headers;
            options.connect_timeout = Some(timeout);
            Ok(SseTransport::connect(options).await?.into())
        }
        TransportSpec::StreamableHttp { url, mut headers } => {
            tracing::debug!(
                header_names = ?headers.keys().collect::<Vec<_>>(),
                "connecting streamable http"
            );
            let mut options = StreamableHttpOptions::new(url);
            // Sent per request by the transport, which keeps them current.
            options.session_id = headers.remove("mcp-session-id");
            options.last_event_id = headers.remove("last-event-id");
            options.headers = headers;
            options.connect_timeout = Some(timeout);
            Ok(StreamableHttpTransport::connect(options).await?.into())
        }
    }
}
