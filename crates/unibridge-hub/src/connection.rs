//! Per-connection lifecycle: upgrade, auth gating, registration handshake,
//! read loop, and the dedicated writer task.
//!
//! Each accepted socket runs one task built around a `select!` loop over
//! the `WebSocket` reader, a close signal (eviction or keepalive death),
//! and the daemon shutdown broadcast. Whatever ends the loop funnels into
//! one cleanup path, so disconnect handling cannot half-run.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use unibridge_core::SessionId;

use crate::auth::AuthOutcome;
use crate::hub::{ConnectionHandle, ConnectionHub};
use crate::keepalive::{self, LastPong};
use crate::protocol::{MAX_FRAME_BYTES, PluginMessage, ServerMessage, close_code};
use crate::registry::Registration;

/// Header the plugin presents its API key in (remote-hosted mode).
const API_KEY_HEADER: &str = "x-api-key";

/// How long the writer gets to flush after the read loop ends.
const WRITER_FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Why a connection's read loop was told to stop.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CloseReason {
    /// A newer registration took over this session's project key.
    Superseded,
    /// The keepalive supervisor declared the connection dead.
    KeepaliveTimeout,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded by newer registration",
            Self::KeepaliveTimeout => "keepalive timeout",
        }
    }
}

/// Drive one plugin connection from accept to cleanup.
pub(crate) async fn handle_connection(
    hub: Arc<ConnectionHub>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut api_key: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        api_key = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    };

    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        },
    };

    let user_id = if hub.config().remote_hosted {
        match gate(&hub, api_key.as_deref()).await {
            Ok(user_id) => Some(user_id),
            Err((code, reason)) => {
                info!(%peer, code, reason, "Connection refused");
                refuse(&mut ws, code, reason).await;
                return;
            },
        }
    } else {
        None
    };

    let (sink, mut reader) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerMessage>(64);
    let mut writer = spawn_writer(sink, outbound_rx);

    let welcome = ServerMessage::Welcome {
        command_timeout_secs: hub.config().command.default_timeout_secs,
        keepalive_interval_secs: hub.config().keepalive.interval_secs,
    };
    if outbound_tx.send(welcome).await.is_err() {
        writer.abort();
        return;
    }

    let (close_tx, mut close_rx) = mpsc::channel::<CloseReason>(1);
    let mut shutdown_rx = hub.subscribe_shutdown();
    let mut session_id: Option<SessionId> = None;
    let mut close_reason = "transport closed";

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                close_reason = "daemon shutdown";
                break;
            }
            reason = close_rx.recv() => {
                if let Some(reason) = reason {
                    close_reason = reason.as_str();
                }
                break;
            }
            frame = reader.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "Read error");
                    break;
                },
                Some(Ok(message)) => {
                    match handle_frame(
                        &hub,
                        &outbound_tx,
                        &close_tx,
                        user_id.as_deref(),
                        &mut session_id,
                        message,
                    )
                    .await
                    {
                        FrameOutcome::Continue => {},
                        FrameOutcome::Close(reason) => {
                            close_reason = reason;
                            break;
                        },
                    }
                },
            },
        }
    }

    if let Some(session_id) = session_id {
        hub.cleanup_session(session_id, close_reason);
    }

    // Drop our sender so the writer sees EOF, then give it a moment to
    // flush before aborting.
    drop(outbound_tx);
    tokio::select! {
        _ = &mut writer => {},
        () = tokio::time::sleep(WRITER_FLUSH_GRACE) => {
            writer.abort();
        },
    }
    debug!(%peer, reason = close_reason, "Connection task finished");
}

/// Validate the presented API key, mapping each outcome to its close code.
async fn gate(
    hub: &Arc<ConnectionHub>,
    api_key: Option<&str>,
) -> Result<String, (u16, &'static str)> {
    let Some(auth) = hub.auth() else {
        return Err((close_code::AUTH_UNAVAILABLE, "auth gate not configured"));
    };
    let Some(api_key) = api_key else {
        return Err((close_code::AUTH_MISSING, "missing API key"));
    };
    match auth.validate(api_key).await {
        AuthOutcome::Valid { user_id } => Ok(user_id),
        AuthOutcome::Rejected { .. } => Err((close_code::AUTH_REJECTED, "API key rejected")),
        AuthOutcome::Unavailable { .. } => Err((
            close_code::AUTH_UNAVAILABLE,
            "API key validation unavailable",
        )),
    }
}

/// Close an un-admitted connection with a specific code and reason.
async fn refuse(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Library(code),
        reason: reason.into(),
    };
    let _ = ws.close(Some(frame)).await;
}

/// Writer task: serializes outbound frames and pushes them to the sink.
fn spawn_writer(
    mut sink: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound_rx: mpsc::Receiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound frame");
                    continue;
                },
            };
            if let Err(e) = sink.send(Message::Text(json)).await {
                debug!(error = %e, "Writer send failed");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

enum FrameOutcome {
    Continue,
    Close(&'static str),
}

async fn handle_frame(
    hub: &Arc<ConnectionHub>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    close_tx: &mpsc::Sender<CloseReason>,
    user_id: Option<&str>,
    session_slot: &mut Option<SessionId>,
    message: Message,
) -> FrameOutcome {
    let text = match message {
        Message::Text(text) => text,
        Message::Close(_) => return FrameOutcome::Close("peer closed"),
        // Transport-level ping/pong is answered by the library; the
        // protocol uses its own envelope-level keepalive.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return FrameOutcome::Continue,
        Message::Binary(_) => {
            debug!("Ignoring binary frame");
            return FrameOutcome::Continue;
        },
    };

    if text.len() > MAX_FRAME_BYTES {
        warn!(bytes = text.len(), "Oversized frame");
        return FrameOutcome::Close("oversized frame");
    }

    let message = match serde_json::from_str::<PluginMessage>(&text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Undecodable frame, dropping");
            return FrameOutcome::Continue;
        },
    };

    match message {
        PluginMessage::Register {
            project_name,
            project_hash,
            unity_version,
            project_path,
        } => {
            let registration = Registration {
                project_name,
                project_hash,
                unity_version,
                project_path,
                user_id: user_id.map(str::to_owned),
            };
            handle_register(hub, outbound_tx, close_tx, session_slot, registration).await
        },
        PluginMessage::RegisterTools { tools } => {
            handle_register_tools(hub, *session_slot, tools).await;
            FrameOutcome::Continue
        },
        PluginMessage::CommandResult { id, result } => {
            hub.deliver_result(id, result);
            FrameOutcome::Continue
        },
        PluginMessage::Pong { session_id } => {
            if *session_slot == Some(session_id) {
                hub.record_pong(session_id);
            } else {
                debug!(claimed = %session_id, "Pong for a session this connection does not own");
            }
            FrameOutcome::Continue
        },
        PluginMessage::Unknown => {
            debug!("Ignoring unknown message type");
            FrameOutcome::Continue
        },
    }
}

/// Registration handshake: mint a session id, tell the plugin, store the
/// session (evicting any superseded one), and start keepalive supervision.
async fn handle_register(
    hub: &Arc<ConnectionHub>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    close_tx: &mpsc::Sender<CloseReason>,
    session_slot: &mut Option<SessionId>,
    registration: Registration,
) -> FrameOutcome {
    // A repeated register on the same connection replaces its session.
    if let Some(previous) = session_slot.take() {
        hub.cleanup_session(previous, "re-registration on same connection");
    }

    let session_id = SessionId::new();
    if outbound_tx
        .send(ServerMessage::Registered { session_id })
        .await
        .is_err()
    {
        return FrameOutcome::Close("writer closed");
    }

    let (session, evicted) = match hub.registry().register(session_id, registration) {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "Registration rejected");
            return FrameOutcome::Close("registration rejected");
        },
    };
    if let Some(old_id) = evicted {
        debug!(old = %old_id, new = %session_id, "Evicting superseded session");
        hub.evict_superseded(old_id);
    }

    let last_pong: LastPong = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
    let keepalive_task = tokio::spawn(keepalive::run_keepalive(
        session_id,
        hub.config().keepalive.clone(),
        Arc::clone(&last_pong),
        outbound_tx.clone(),
        close_tx.clone(),
        hub.subscribe_shutdown(),
    ));
    hub.install_connection(
        session_id,
        ConnectionHandle {
            outbound: outbound_tx.clone(),
            close: close_tx.clone(),
            last_pong,
            keepalive: keepalive_task,
        },
    );
    *session_slot = Some(session_id);

    info!(
        session = %session_id,
        project = %session.project_name,
        hash = %session.project_hash,
        unity = %session.unity_version,
        "Plugin registered"
    );
    FrameOutcome::Continue
}

async fn handle_register_tools(
    hub: &Arc<ConnectionHub>,
    session_id: Option<SessionId>,
    tools: Vec<crate::protocol::ToolSpec>,
) {
    let Some(session_id) = session_id else {
        warn!("register_tools before registration, dropping");
        return;
    };
    let count = tools.len();
    if !hub.registry().set_tools(session_id, tools) {
        warn!(session = %session_id, "register_tools for unknown session");
        return;
    }
    info!(session = %session_id, tools = count, "Tool manifest replaced");

    if let Some(hook) = hub.tools_hook() {
        if let Some(session) = hub.registry().get(session_id) {
            hook.tools_changed(&session).await;
        }
    }
}
