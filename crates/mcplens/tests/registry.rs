#![cfg(unix)]

use std::time::Duration;

use mcplens::{
    DefaultEnvironment, Error, STDERR_NOTIFICATION_METHOD, SessionMessage, SessionRegistry,
    TransportConfig, TransportState,
};
use serde_json::json;
use tokio::sync::broadcast;

fn registry() -> SessionRegistry {
    SessionRegistry::new(DefaultEnvironment::from_process().unwrap())
}

fn shell(script: &str) -> TransportConfig {
    TransportConfig::stdio("sh")
        .with_args(format!("-c '{script}'"))
        .with_timeout(Duration::from_secs(10))
}

async fn next_message(rx: &mut broadcast::Receiver<SessionMessage>) -> SessionMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("fan-out message")
        .unwrap()
}

#[tokio::test]
async fn unknown_transport_type_registers_nothing() {
    let registry = registry();
    let config = TransportConfig {
        transport_type: "websocket".to_string(),
        ..TransportConfig::default()
    };
    let err = registry.create_session(&config).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err:?}");
    assert!(registry.is_empty().await);
    assert_eq!(registry.backing_session().await, None);
}

#[tokio::test]
async fn stdio_session_round_trips_through_fan_out() {
    let registry = registry();
    let mut rx = registry.subscribe();
    let id = registry
        .create_session(&TransportConfig::stdio("cat"))
        .await
        .unwrap();
    assert_eq!(
        registry.transport_state(id).await,
        Some(TransportState::Ready)
    );

    let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
    registry.send_message(id, &ping).await.unwrap();

    let received = next_message(&mut rx).await;
    assert_eq!(received.session_id, id);
    assert_eq!(received.message, ping);

    assert!(registry.close_session(id).await);
    assert!(!registry.close_session(id).await);
    let err = registry.send_message(id, &ping).await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(missing) if missing == id));
}

#[tokio::test]
async fn on_message_listener_sees_every_session() {
    let registry = registry();
    let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
    let subscription = registry.on_message(move |message| {
        let _ = tx.send(message.session_id);
    });

    let first = registry
        .open_session(&TransportConfig::stdio("cat"))
        .await
        .unwrap();
    let second = registry
        .open_session(&TransportConfig::stdio("cat"))
        .await
        .unwrap();
    registry.send_message(first, &json!({"n": 1})).await.unwrap();
    registry.send_message(second, &json!({"n": 2})).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..2 {
        ids.push(
            tokio::time::timeout(Duration::from_secs(5), seen.recv())
                .await
                .unwrap()
                .unwrap(),
        );
    }
    ids.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(ids, expected);

    subscription.unsubscribe();
    registry.close_all().await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn creating_a_session_replaces_the_backing_session() {
    let registry = registry();
    let mut rx = registry.subscribe();
    // `exec` keeps the shell's pid, so `$$` is the server process.
    let first = registry
        .create_session(&shell(r#"printf "{\"pid\":%s}\n" "$$"; exec cat"#))
        .await
        .unwrap();
    let announced = next_message(&mut rx).await;
    assert_eq!(announced.session_id, first);
    let first_pid = announced.message["pid"].as_u64().unwrap();

    let second = registry
        .create_session(&TransportConfig::stdio("cat"))
        .await
        .unwrap();

    assert!(!registry.contains(first).await);
    assert_eq!(registry.backing_session().await, Some(second));
    let alive = std::process::Command::new("kill")
        .arg("-0")
        .arg(first_pid.to_string())
        .status()
        .unwrap();
    assert!(!alive.success(), "previous backing server {first_pid} still running");

    let extra = registry
        .open_session(&TransportConfig::stdio("cat"))
        .await
        .unwrap();
    assert_eq!(registry.backing_session().await, Some(second));
    assert_eq!(registry.len().await, 2);

    assert!(registry.close_session(second).await);
    assert_eq!(registry.backing_session().await, None);
    assert!(registry.contains(extra).await);
    registry.close_all().await;
}

#[tokio::test]
async fn session_env_reaches_the_server() {
    let registry = registry();
    let mut rx = registry.subscribe();
    let config = shell(r#"printf "{\"marker\":\"%s\"}\n" "$MCPLENS_MARKER"; exec cat"#)
        .with_env("MCPLENS_MARKER", "42");
    let id = registry.create_session(&config).await.unwrap();

    let received = next_message(&mut rx).await;
    assert_eq!(received.session_id, id);
    assert_eq!(received.message, json!({"marker": "42"}));
    registry.close_all().await;
}

#[tokio::test]
async fn session_env_overrides_the_default_environment() {
    let default_env = DefaultEnvironment::from_parts(
        [
            ("HOME".to_string(), "/home/default".to_string()),
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ],
        None,
    )
    .unwrap();
    let registry = SessionRegistry::new(default_env);
    let mut rx = registry.subscribe();

    let config = shell(r#"printf "{\"home\":\"%s\",\"path\":\"%s\"}\n" "$HOME" "$PATH"; exec cat"#)
        .with_env("HOME", "/home/override")
        .with_env("PATH", "/bin:/usr/bin:/opt/mcplens/bin");
    let id = registry.create_session(&config).await.unwrap();

    let received = next_message(&mut rx).await;
    assert_eq!(received.session_id, id);
    assert_eq!(
        received.message,
        json!({"home": "/home/override", "path": "/bin:/usr/bin:/opt/mcplens/bin"})
    );
    registry.close_all().await;
}

#[tokio::test]
async fn stderr_is_relayed_as_notifications() {
    let registry = registry();
    let mut rx = registry.subscribe();
    let id = registry
        .create_session(&shell("echo oops >&2; exec cat"))
        .await
        .unwrap();

    let received = next_message(&mut rx).await;
    assert_eq!(received.session_id, id);
    assert_eq!(received.message["method"], STDERR_NOTIFICATION_METHOD);
    assert!(
        received.message["params"]["content"]
            .as_str()
            .unwrap()
            .contains("oops")
    );
    registry.close_all().await;
}

#[tokio::test]
async fn early_exit_surfaces_the_exit_status() {
    let registry = registry();
    let err = registry.create_session(&shell("exit 7")).await.unwrap_err();
    assert!(matches!(err, Error::TransportStart { .. }), "{err:?}");
    assert_eq!(err.exit_status().and_then(|status| status.code()), Some(7));
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn config_reports_the_default_environment() {
    let env = DefaultEnvironment::from_parts(
        [("PATH".to_string(), "/usr/bin".to_string())],
        Some(r#"{"EXTRA":"1"}"#),
    )
    .unwrap();
    let registry = SessionRegistry::new(env);
    assert_eq!(
        serde_json::to_value(registry.get_config()).unwrap(),
        json!({"defaultEnvironment": {"EXTRA": "1", "PATH": "/usr/bin"}})
    );
}

#[tokio::test]
async fn timed_out_partial_send_is_not_silently_retried() {
    let registry = registry();
    let config = shell("sleep 5; exec cat").with_timeout(Duration::from_millis(800));
    let id = registry.create_session(&config).await.unwrap();

    // Larger than a pipe buffer, so the write stalls mid-line.
    let big = json!({"jsonrpc": "2.0", "method": "big", "params": {"pad": "x".repeat(1 << 20)}});
    let err = registry.send_message(id, &big).await.unwrap_err();
    assert!(matches!(err, Error::SendFailed(_)), "{err:?}");
    assert_eq!(
        registry.transport_state(id).await,
        Some(TransportState::Failed)
    );

    let err = registry
        .send_message(id, &json!({"jsonrpc": "2.0", "method": "small"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendFailed(_)), "{err:?}");
    assert!(registry.close_session(id).await);
}
