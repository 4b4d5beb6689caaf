use std::time::Duration;

use anyhow::{Context, Result};
use mcplens::{DefaultEnvironment, MCP_PROTOCOL_VERSION, SessionRegistry, TransportConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn print_help() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p mcplens --example stdio_self_spawn");
    eprintln!();
    eprintln!("Notes:");
    eprintln!("  - This example is self-contained: it spawns itself as an MCP server over stdio.");
    eprintln!("  - The child process is started with an internal flag: --server");
}

fn is_server_mode() -> bool {
    std::env::args().any(|arg| arg == "--server")
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return Ok(());
    }

    if is_server_mode() {
        return server_main().await;
    }
    client_main().await
}

async fn client_main() -> Result<()> {
    let exe = std::env::current_exe().context("resolve current executable path")?;
    let config = TransportConfig::stdio(exe.to_string_lossy())
        .with_args("--server")
        .with_timeout(Duration::from_secs(10));
    let default_env = DefaultEnvironment::from_process()?;

    let outcome = mcplens::ping(&config, &default_env).await;
    println!("ping:");
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    let tools = mcplens::list_tools(&config, &default_env)
        .await
        .context("tools/list")?;
    println!();
    println!("tools/list:");
    println!("{}", serde_json::to_string_pretty(&tools)?);

    // Raw session: the registry relays messages without interpreting them.
    let registry = SessionRegistry::new(default_env);
    let mut messages = registry.subscribe();
    let id = registry
        .create_session(&config)
        .await
        .context("create session")?;
    registry
        .send_message(
            id,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        )
        .await
        .context("send ping")?;
    let reply = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .context("wait for session reply")??;
    println!();
    println!("session {id} relayed:");
    println!("{}", serde_json::to_string_pretty(&reply)?);

    registry.close_all().await;
    Ok(())
}

async fn server_main() -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications carry no id and get no reply.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request["method"].as_str().unwrap_or_default();
        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "serverInfo": { "name": "stdio-self-spawn-server", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {} },
                },
            }),
            "ping" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [
                        {
                            "name": "example.echo",
                            "description": "Echo back the provided message",
                            "inputSchema": {
                                "type": "object",
                                "properties": { "message": { "type": "string" } },
                                "required": ["message"]
                            }
                        }
                    ]
                },
            }),
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {other}") },
            }),
        };

        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    Ok(())
}
