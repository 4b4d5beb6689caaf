use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mcplens::{
    DefaultEnvironment, JsonFileProfileStore, JsonFileSettingsStore, NewServerProfile,
    ProfileStore, SessionMessage, SessionRegistry, SettingsStore, TransportConfig,
    TransportState,
};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcplens")]
#[command(about = "MCP client sessions over stdio, SSE and streamable HTTP")]
struct Cli {
    /// Connection profile file.
    #[arg(long, default_value = "mcplens-profiles.json")]
    profiles: PathBuf,

    /// Settings file holding the stored API key.
    #[arg(long, default_value = "mcplens-settings.json")]
    settings: PathBuf,

    /// Compact JSON output (default: pretty JSON).
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug). `MCPLENS_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, print the server's version and disconnect. Exits 1 when the server is unreachable.
    Ping(Target),
    /// Print the tool catalog of a stdio server.
    ListTools(Target),
    /// Open a session; JSON-RPC lines on stdin go to the server, everything it sends is printed.
    Session(Target),
    /// Print the environment spawned stdio servers start from.
    Env,
    /// Manage saved connection profiles.
    Profiles {
        #[command(subcommand)]
        command: ProfilesCommand,
    },
    /// Read or store the API key kept in the settings file.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print the stored API key (empty when unset).
    GetKey,
    /// Store KEY, replacing any previous one. An empty KEY clears it.
    SetKey { key: String },
}

#[derive(Subcommand)]
enum ProfilesCommand {
    List,
    Add {
        name: String,
        #[command(flatten)]
        target: Target,
    },
    Remove {
        id: String,
    },
}

/// Exactly one of `--profile`, `--config-json`, `--stdio`, `--sse`, `--http` picks the server.
#[derive(Args)]
struct Target {
    /// Id of a saved profile.
    #[arg(long)]
    profile: Option<String>,

    /// A full connection object, e.g. `{"transportType":"stdio","command":"node"}`.
    #[arg(long)]
    config_json: Option<String>,

    /// Spawn COMMAND and speak MCP over its stdin/stdout.
    #[arg(long, value_name = "COMMAND")]
    stdio: Option<String>,

    /// Arguments for `--stdio`, split like a shell would.
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Extra environment for `--stdio` (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Connect to a legacy SSE endpoint.
    #[arg(long, value_name = "URL")]
    sse: Option<String>,

    /// Connect to a streamable-HTTP endpoint.
    #[arg(long, value_name = "URL")]
    http: Option<String>,

    /// Request header for `--sse` / `--http` (repeatable).
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    headers: Vec<(String, String)>,

    /// Start and request timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

impl Target {
    async fn resolve(self, profiles: &JsonFileProfileStore) -> anyhow::Result<TransportConfig> {
        let picked = [
            self.profile.is_some(),
            self.config_json.is_some(),
            self.stdio.is_some(),
            self.sse.is_some(),
            self.http.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if picked != 1 {
            anyhow::bail!(
                "pass exactly one of --profile, --config-json, --stdio, --sse, --http"
            );
        }

        let mut config = if let Some(id) = self.profile {
            profiles
                .get(&id)
                .await
                .with_context(|| format!("load profile {id}"))?
                .with_context(|| format!("profile {id} not found in {}", profiles.path().display()))?
                .config
        } else if let Some(raw) = self.config_json {
            serde_json::from_str(&raw).context("parse --config-json")?
        } else if let Some(command) = self.stdio {
            TransportConfig::stdio(command)
        } else if let Some(url) = self.sse {
            TransportConfig::sse(url)
        } else if let Some(url) = self.http {
            TransportConfig::streamable_http(url)
        } else {
            anyhow::bail!("no connection target given");
        };

        if let Some(args) = self.args {
            config.args = Some(args);
        }
        config.env.extend(self.env);
        config.headers.extend(self.headers);
        if let Some(timeout_ms) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(timeout_ms));
        }
        Ok(config)
    }
}

fn init_logging(verbosity: u8) {
    let fallback = match verbosity {
        0 => "warn",
        1 => "info,mcplens=info,mcplens_transport=info",
        _ => "debug",
    };
    let env_filter =
        EnvFilter::try_from_env("MCPLENS_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

fn render<T: Serialize>(value: &T, compact: bool) -> anyhow::Result<String> {
    Ok(if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let profiles = JsonFileProfileStore::new(&cli.profiles);

    let result: Value = match cli.command {
        Command::Ping(target) => {
            let config = target.resolve(&profiles).await?;
            let default_env = DefaultEnvironment::from_process()?;
            let outcome = mcplens::ping(&config, &default_env).await;
            println!("{}", render(&outcome, cli.json)?);
            return Ok(if outcome.is_pong() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::ListTools(target) => {
            let config = target.resolve(&profiles).await?;
            let default_env = DefaultEnvironment::from_process()?;
            mcplens::list_tools(&config, &default_env)
                .await
                .context("list-tools")?
        }
        Command::Session(target) => {
            let config = target.resolve(&profiles).await?;
            return run_session(config).await;
        }
        Command::Env => {
            let registry = SessionRegistry::from_process()?;
            serde_json::to_value(registry.get_config())?
        }
        Command::Profiles { command } => match command {
            ProfilesCommand::List => serde_json::to_value(profiles.list().await?)?,
            ProfilesCommand::Add { name, target } => {
                if target.profile.is_some() {
                    anyhow::bail!("--profile cannot be used when adding a profile");
                }
                let config = target.resolve(&profiles).await?;
                let added = profiles
                    .add(NewServerProfile { name, config })
                    .await
                    .context("add profile")?;
                serde_json::to_value(added)?
            }
            ProfilesCommand::Remove { id } => {
                let removed = profiles
                    .remove(&id)
                    .await
                    .with_context(|| format!("remove profile {id}"))?;
                serde_json::json!({ "id": id, "removed": removed })
            }
        },
        Command::Settings { command } => {
            let settings = JsonFileSettingsStore::new(&cli.settings);
            match command {
                SettingsCommand::GetKey => {
                    let key = settings.api_key().await.context("read settings")?;
                    serde_json::json!({ "apiKey": key })
                }
                SettingsCommand::SetKey { key } => {
                    settings.set_api_key(&key).await.context("store api key")?;
                    serde_json::json!({ "stored": true })
                }
            }
        }
    };

    println!("{}", render(&result, cli.json)?);
    Ok(ExitCode::SUCCESS)
}

/// How often the session loop checks that the server is still there.
const STATE_POLL: Duration = Duration::from_millis(200);

/// Relays stdin lines into one session and prints its fan-out as JSON lines. Ends on Ctrl-C,
/// when the server goes away, or once stdin is closed and every request sent from it has been
/// answered (bounded by the session timeout).
async fn run_session(config: TransportConfig) -> anyhow::Result<ExitCode> {
    let registry = SessionRegistry::from_process()?;
    let mut messages = registry.subscribe();
    let id = registry
        .create_session(&config)
        .await
        .context("create session")?;
    eprintln!("session {id} ({})", config.transport_type);

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut pending: HashSet<String> = HashSet::new();
    let mut drain_deadline: Option<Instant> = None;
    let mut poll = tokio::time::interval(STATE_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("read stdin")? else {
                    stdin_open = false;
                    if pending.is_empty() {
                        break ExitCode::SUCCESS;
                    }
                    tracing::debug!(pending = pending.len(), "stdin closed; waiting for replies");
                    drain_deadline = Some(Instant::now() + config.timeout());
                    continue;
                };
                let Some(message) = parse_line(&line) else { continue };
                match registry.send_message(id, &message).await {
                    Ok(()) => {
                        if let Some(request) = request_id(&message) {
                            pending.insert(request);
                        }
                    }
                    Err(err) => tracing::error!("send failed: {err}"),
                }
            }
            received = messages.recv() => match received {
                Ok(message) => {
                    if message.session_id == id {
                        if let Some(answered) = response_id(&message.message) {
                            pending.remove(&answered);
                        }
                    }
                    print_message(&message);
                    if !stdin_open && pending.is_empty() {
                        break ExitCode::SUCCESS;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "session output lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break ExitCode::SUCCESS,
            },
            _ = poll.tick() => {
                let state = registry.transport_state(id).await;
                if matches!(state, None | Some(TransportState::Failed)) {
                    // Whatever the server wrote before going away is still worth printing.
                    while let Ok(message) = messages.try_recv() {
                        print_message(&message);
                    }
                    eprintln!("session {id} ended: transport failed");
                    break ExitCode::FAILURE;
                }
            }
            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                if drain_deadline.is_some() =>
            {
                tracing::warn!(unanswered = pending.len(), "gave up waiting for replies");
                break ExitCode::SUCCESS;
            }
            _ = tokio::signal::ctrl_c() => break ExitCode::SUCCESS,
        }
    };

    registry.close_all().await;
    Ok(exit)
}

fn parse_line(line: &str) -> Option<Value> {
    if line.trim().is_empty() {
        return None;
    }
    serde_json::from_str(line)
        .map_err(|err| tracing::warn!("skipping invalid json line: {err}"))
        .ok()
}

/// Key of a request that expects an answer. Notifications have no id.
fn request_id(message: &Value) -> Option<String> {
    message.get("method")?;
    message.get("id").filter(|id| !id.is_null()).map(Value::to_string)
}

fn response_id(message: &Value) -> Option<String> {
    if message.get("method").is_some() {
        return None;
    }
    message.get("id").filter(|id| !id.is_null()).map(Value::to_string)
}

fn print_message(message: &SessionMessage) {
    match serde_json::to_string(message) {
        Ok(line) => println!("{line}"),
        Err(err) => tracing::warn!("encode session message failed: {err}"),
    }
}
