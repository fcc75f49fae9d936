//! End-to-end tests over real WebSockets: a hub on a loopback port and a
//! scripted fake plugin on the other side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use unibridge_core::{BridgeError, InstanceToken, SessionId, TenantKey};
use unibridge_hub::{
    AuthConfig, AuthGate, CommandConfig, ConnectionHub, HubConfig, InstanceResolver,
    KeepaliveConfig, PluginMessage, ServerMessage, SessionRegistry,
};

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(config: HubConfig) -> (Arc<ConnectionHub>, SocketAddr) {
    let registry = Arc::new(SessionRegistry::new(config.remote_hosted));
    let mut hub = ConnectionHub::new(config.clone(), registry);
    if config.remote_hosted {
        hub = hub.with_auth(AuthGate::new(&config.auth).unwrap());
    }
    let hub = Arc::new(hub);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&hub).serve(listener));
    (hub, addr)
}

fn to_frame(message: &PluginMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap())
}

async fn next_server_message(ws: &mut ClientWs) -> ServerMessage {
    loop {
        match ws.next().await.expect("connection closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

/// Connect, consume the welcome, register, and return the assigned id.
async fn connect_and_register(addr: SocketAddr, name: &str, hash: &str) -> (ClientWs, SessionId) {
    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

    let welcome = next_server_message(&mut ws).await;
    assert!(matches!(welcome, ServerMessage::Welcome { .. }));

    ws.send(to_frame(&PluginMessage::Register {
        project_name: name.to_string(),
        project_hash: hash.to_string(),
        unity_version: "2022.3.10f1".to_string(),
        project_path: None,
    }))
    .await
    .unwrap();

    let registered = next_server_message(&mut ws).await;
    let ServerMessage::Registered { session_id } = registered else {
        panic!("expected registered, got {registered:?}");
    };
    (ws, session_id)
}

/// Run the plugin side until it has answered `count` commands, echoing the
/// params back. Pings are answered along the way.
async fn echo_commands(ws: &mut ClientWs, session_id: SessionId, count: usize) {
    let mut answered = 0;
    while answered < count {
        match next_server_message(ws).await {
            ServerMessage::ExecuteCommand { id, name, params, .. } => {
                ws.send(to_frame(&PluginMessage::CommandResult {
                    id,
                    result: json!({"command": name, "echo": params}),
                }))
                .await
                .unwrap();
                answered += 1;
            },
            ServerMessage::Ping => {
                ws.send(to_frame(&PluginMessage::Pong { session_id })).await.unwrap();
            },
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn register_dispatch_and_result() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let (mut ws, session_id) = connect_and_register(addr, "MyGame", "h1").await;

    let plugin = tokio::spawn(async move {
        echo_commands(&mut ws, session_id, 1).await;
        ws
    });

    // Resolve by token the way the agent-facing layer does.
    let resolver = InstanceResolver::new(
        Arc::clone(hub.registry()),
        hub.config().resolver.clone(),
    );
    let token: InstanceToken = "MyGame@h1".parse().unwrap();
    let resolved = resolver
        .resolve(Some(&token), &TenantKey::Local, true)
        .await
        .unwrap();
    assert_eq!(resolved, session_id);

    let result = hub
        .send_command(resolved, "create_game_object", json!({"name": "Player"}), Some(30))
        .await
        .unwrap();
    assert_eq!(result["command"], "create_game_object");
    assert_eq!(result["echo"]["name"], "Player");
    assert_eq!(hub.status().pending_commands, 0);

    plugin.await.unwrap();
}

#[tokio::test]
async fn disconnect_mid_command_resolves_promptly() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let (mut ws, session_id) = connect_and_register(addr, "MyGame", "h1").await;

    let dispatch = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.send_command(session_id, "bake_lighting", Value::Null, Some(3600)).await
        })
    };

    // Receive the command, then drop the connection without answering.
    let ServerMessage::ExecuteCommand { .. } = next_server_message(&mut ws).await else {
        panic!("expected execute_command");
    };
    drop(ws);

    let started = Instant::now();
    let err = dispatch.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Disconnected { session_id: sid } if sid == session_id
    ));
    // Promptly — not after the hour-long command timeout.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(hub.status().pending_commands, 0);

    // The disconnect also unregistered the session.
    assert!(hub.registry().get(session_id).is_none());
}

#[tokio::test]
async fn fast_fail_commands_are_bounded_by_the_short_timeout() {
    let config = HubConfig {
        command: CommandConfig {
            fast_fail_timeout_secs: 1,
            ..CommandConfig::default()
        },
        ..HubConfig::default()
    };
    let (hub, addr) = start_hub(config).await;
    let (mut ws, session_id) = connect_and_register(addr, "MyGame", "h1").await;

    let started = Instant::now();
    // The plugin never answers; the caller asked for ten minutes.
    let err = hub
        .send_command(session_id, "status", Value::Null, Some(600))
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::EditorBusy { .. }));
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(3));

    // The connection itself is still healthy.
    let ServerMessage::ExecuteCommand { .. } = next_server_message(&mut ws).await else {
        panic!("expected the stale execute_command frame");
    };
    assert!(hub.registry().get(session_id).is_some());
}

#[tokio::test]
async fn newer_registration_supersedes_and_cancels_in_flight_commands() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let (mut ws_a, session_a) = connect_and_register(addr, "MyGame", "h1").await;

    let dispatch = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.send_command(session_a, "bake_lighting", Value::Null, Some(3600)).await
        })
    };
    let ServerMessage::ExecuteCommand { .. } = next_server_message(&mut ws_a).await else {
        panic!("expected execute_command");
    };

    // A second Editor for the same project registers (reload reconnect).
    let (_ws_b, session_b) = connect_and_register(addr, "MyGame", "h1").await;
    assert_ne!(session_a, session_b);

    // The old session's pending command resolves Disconnected, promptly.
    let err = tokio::time::timeout(Duration::from_secs(3), dispatch)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Disconnected { session_id } if session_id == session_a
    ));

    // Only the newest session is resolvable for the project.
    assert_eq!(
        hub.registry().get_id_by_hash("h1", &TenantKey::Local),
        Some(session_b)
    );
    assert!(hub.registry().get(session_a).is_none());
}

#[tokio::test]
async fn keepalive_evicts_a_silent_plugin() {
    let config = HubConfig {
        keepalive: KeepaliveConfig {
            interval_secs: 1,
            dead_after_secs: 2,
        },
        ..HubConfig::default()
    };
    let (hub, addr) = start_hub(config).await;
    let (mut ws, session_id) = connect_and_register(addr, "MyGame", "h1").await;

    // Swallow pings without ever answering.
    let silent = tokio::spawn(async move { while ws.next().await.is_some() {} });

    let deadline = Instant::now() + Duration::from_secs(6);
    while hub.registry().get(session_id).is_some() {
        assert!(Instant::now() < deadline, "silent plugin was never evicted");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    silent.await.unwrap();
}

#[tokio::test]
async fn ponging_plugin_stays_registered() {
    let config = HubConfig {
        keepalive: KeepaliveConfig {
            interval_secs: 1,
            dead_after_secs: 2,
        },
        ..HubConfig::default()
    };
    let (hub, addr) = start_hub(config).await;
    let (mut ws, session_id) = connect_and_register(addr, "MyGame", "h1").await;

    let plugin = tokio::spawn(async move {
        loop {
            match next_server_message(&mut ws).await {
                ServerMessage::Ping => {
                    ws.send(to_frame(&PluginMessage::Pong { session_id })).await.unwrap();
                },
                _ => {},
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(hub.registry().get(session_id).is_some());
    plugin.abort();
}

#[tokio::test]
async fn remote_mode_refuses_missing_credential_with_distinct_code() {
    let config = HubConfig {
        remote_hosted: true,
        auth: AuthConfig {
            // Never contacted for a missing key.
            endpoint: Some("http://127.0.0.1:1/validate".into()),
            ..AuthConfig::default()
        },
        ..HubConfig::default()
    };
    let (_hub, addr) = start_hub(config).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let frame = loop {
        match ws.next().await {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("expected a close frame"),
        }
    };
    let frame = frame.expect("close frame should carry a code");
    assert_eq!(u16::from(frame.code), 4401);
}

#[tokio::test]
async fn remote_mode_admits_valid_key_and_scopes_by_tenant() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Scripted validation endpoint: every key belongs to "alice".
    let hits = Arc::new(AtomicUsize::new(0));
    let auth_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let auth_addr = auth_listener.local_addr().unwrap();
    {
        let hits = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = auth_listener.accept().await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"valid":true,"user_id":"alice"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
    }

    let config = HubConfig {
        remote_hosted: true,
        auth: AuthConfig {
            endpoint: Some(format!("http://{auth_addr}/validate")),
            ..AuthConfig::default()
        },
        ..HubConfig::default()
    };
    let (hub, addr) = start_hub(config).await;

    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-api-key", "key-alice-1234".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    let welcome = next_server_message(&mut ws).await;
    assert!(matches!(welcome, ServerMessage::Welcome { .. }));

    ws.send(to_frame(&PluginMessage::Register {
        project_name: "MyGame".to_string(),
        project_hash: "h1".to_string(),
        unity_version: "2022.3.10f1".to_string(),
        project_path: None,
    }))
    .await
    .unwrap();
    let ServerMessage::Registered { session_id } = next_server_message(&mut ws).await else {
        panic!("expected registered");
    };

    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The session is owned by alice and invisible to other tenants.
    let alice = TenantKey::from_user(Some("alice"));
    let bob = TenantKey::from_user(Some("bob"));
    let listed = hub.registry().list(Some(&alice)).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, session_id);
    assert_eq!(listed[0].user_id.as_deref(), Some("alice"));
    assert!(hub.registry().list(Some(&bob)).unwrap().is_empty());
    assert!(matches!(
        hub.registry().list(None),
        Err(BridgeError::TenantRequired)
    ));
}
