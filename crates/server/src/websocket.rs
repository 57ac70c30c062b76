//! WebSocket handling
//!
//! One duplex endpoint per client. Inbound frames are run/abort requests;
//! outbound multiplexes agent output and watcher broadcasts. Frames from
//! a single invocation reach the originating socket in emission order;
//! watcher frames interleave freely and are the first to be dropped under
//! backpressure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agentdeck_protocol::{new_id, ClientFrame, CommandOptions, ServerFrame};
use agentdeck_runner::{spawn_agent, RunOptions, RunnerEvent};

use crate::error::{GatewayError, GatewayResult};
use crate::state::Gateway;
use crate::watcher::SendOutcome;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound queue capacity per socket. Invocation pumps await sends and
/// therefore block when the client is slow; watcher frames use try_send.
const OUTBOUND_CAPACITY: usize = 256;

/// Messages that can be sent through the WebSocket
enum Outbound {
    Frame(ServerFrame),
    Pong(bytes::Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<Gateway>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<Gateway>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);

    // Forward queued messages to the wire
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server frame"
                        );
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Register with the watcher broadcaster
    let watch_tx = outbound_tx.clone();
    let watch_id = state.watch_clients.attach(Box::new(move |frame| {
        match watch_tx.try_send(Outbound::Frame(frame.clone())) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }));

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(Outbound::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.frame.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse client frame"
                );
                send_frame(
                    &outbound_tx,
                    ServerFrame::Error {
                        error: format!("invalid frame: {e}"),
                    },
                )
                .await;
                continue;
            }
        };

        match frame {
            ClientFrame::ClaudeCommand { command, options } => {
                if let Err(e) =
                    handle_command(&state, conn_id, &outbound_tx, command, options).await
                {
                    warn!(
                        component = "websocket",
                        event = "ws.command.rejected",
                        connection_id = conn_id,
                        error = %e,
                        "Run frame rejected"
                    );
                    send_frame(
                        &outbound_tx,
                        ServerFrame::Error {
                            error: e.to_string(),
                        },
                    )
                    .await;
                }
            }
            ClientFrame::AbortSession { session_id } => {
                let success = state.invocations.abort(&session_id);
                info!(
                    component = "websocket",
                    event = "ws.session.abort",
                    connection_id = conn_id,
                    session_id = %session_id,
                    success = success,
                    "Abort requested"
                );
                send_frame(
                    &outbound_tx,
                    ServerFrame::SessionAborted {
                        session_id,
                        success,
                    },
                )
                .await;
            }
        }
    }

    state.watch_clients.detach(watch_id);
    let aborted = state.invocations.abort_owned_by(conn_id);
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        aborted_invocations = aborted,
        "WebSocket connection closed"
    );
    send_task.abort();
}

async fn send_frame(tx: &mpsc::Sender<Outbound>, frame: ServerFrame) {
    let _ = tx.send(Outbound::Frame(frame)).await;
}

/// Validate a run frame, spawn the agent, and wire its event stream to
/// this socket.
async fn handle_command(
    state: &Arc<Gateway>,
    conn_id: u64,
    outbound_tx: &mpsc::Sender<Outbound>,
    command: Option<String>,
    options: CommandOptions,
) -> GatewayResult<()> {
    let cwd = resolve_cwd(state, &options)?;

    let invocation_id = new_id();
    let input_session_id = options.session_id.clone();
    let prompt = command.filter(|c| !c.trim().is_empty());
    let has_prompt = prompt.is_some();

    let tools = options.tools_settings.unwrap_or_default();
    let run_opts = RunOptions {
        agent_bin: None,
        prompt,
        stdin_command: None,
        cwd: cwd.clone(),
        session_id: input_session_id.clone(),
        resume: options.resume,
        permission_mode: options.permission_mode,
        allowed_tools: tools.allowed_tools,
        disallowed_tools: tools.disallowed_tools,
        skip_permissions: tools.skip_permissions,
        images: options.images,
        store_env: state.env.as_record(),
        extra_env: options.env,
        mcp_config: Some(state.mcp_config.clone()),
        default_model: default_model(),
    };

    let (event_tx, event_rx) = mpsc::channel::<RunnerEvent>(OUTBOUND_CAPACITY);
    let handle = match spawn_agent(run_opts, event_tx).await {
        Ok(handle) => handle,
        Err(e) => {
            // Spawn failures surface as agent-error, not a protocol error
            warn!(
                component = "websocket",
                event = "ws.invocation.spawn_failed",
                connection_id = conn_id,
                error = %e,
                "Agent spawn failed"
            );
            send_frame(
                outbound_tx,
                ServerFrame::AgentError {
                    error: e.to_string(),
                },
            )
            .await;
            return Ok(());
        }
    };

    let key = input_session_id
        .clone()
        .unwrap_or_else(|| invocation_id.clone());
    state.invocations.insert(key.clone(), handle, conn_id);
    info!(
        component = "websocket",
        event = "ws.invocation.started",
        connection_id = conn_id,
        invocation_id = %invocation_id,
        session_id = ?input_session_id,
        cwd = %cwd.display(),
        "Agent invocation started"
    );

    let forward_state = state.clone();
    let forward_tx = outbound_tx.clone();
    tokio::spawn(async move {
        forward_invocation(forward_state, event_rx, forward_tx, key, input_session_id, has_prompt)
            .await;
    });
    Ok(())
}

/// Pump runner events into the socket, preserving emission order. The
/// terminal `agent-complete` also retires the abort-map entry.
async fn forward_invocation(
    state: Arc<Gateway>,
    mut event_rx: mpsc::Receiver<RunnerEvent>,
    outbound_tx: mpsc::Sender<Outbound>,
    mut key: String,
    input_session_id: Option<String>,
    has_prompt: bool,
) {
    // Once the client is gone we stop sending but keep draining so the
    // reaper's terminal event still cleans up the map
    let mut client_gone = false;

    while let Some(event) = event_rx.recv().await {
        let frame = match event {
            RunnerEvent::SessionCaptured { session_id } => {
                state.invocations.rekey(&key, &session_id);
                let announce = input_session_id.is_none();
                key = session_id.clone();
                if announce {
                    Some(ServerFrame::SessionCreated { session_id })
                } else {
                    None
                }
            }
            RunnerEvent::Response(data) => Some(ServerFrame::AgentResponse { data }),
            RunnerEvent::Output(data) => Some(ServerFrame::AgentOutput { data }),
            RunnerEvent::Stderr(chunk) => Some(ServerFrame::AgentError { error: chunk }),
            RunnerEvent::Complete { exit_code } => {
                state.invocations.remove(&key);
                let frame = ServerFrame::AgentComplete {
                    exit_code,
                    is_new_session: input_session_id.is_none() && has_prompt,
                };
                if !client_gone {
                    let _ = outbound_tx.send(Outbound::Frame(frame)).await;
                }
                debug!(
                    component = "websocket",
                    event = "ws.invocation.completed",
                    session_id = %key,
                    exit_code = exit_code,
                    "Invocation completed"
                );
                return;
            }
        };

        if let Some(frame) = frame {
            if !client_gone && outbound_tx.send(Outbound::Frame(frame)).await.is_err() {
                client_gone = true;
            }
        }
    }
}

/// Working directory for the spawn: an alias is resolved through the
/// registry, anything else is taken as a real path. Never the alias
/// directory itself.
fn resolve_cwd(state: &Gateway, options: &CommandOptions) -> GatewayResult<PathBuf> {
    let requested = options
        .project_path
        .as_deref()
        .or(options.cwd.as_deref())
        .ok_or_else(|| GatewayError::invalid("missing cwd and projectPath"))?;

    // Absolute paths are real paths; only relative names can be aliases
    let real = if PathBuf::from(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        match state.projects.resolve_alias(requested) {
            Ok(resolved) => resolved,
            Err(_) => PathBuf::from(requested),
        }
    };
    if !real.is_dir() {
        return Err(GatewayError::not_found(format!(
            "project directory does not exist: {}",
            real.display()
        )));
    }
    Ok(real)
}

fn default_model() -> String {
    std::env::var("AGENTDECK_DEFAULT_MODEL").unwrap_or_else(|_| "sonnet".to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn gateway(tmp: &TempDir) -> Arc<Gateway> {
        let root = tmp.path().join("projects");
        std::fs::create_dir_all(&root).unwrap();
        Arc::new(Gateway::new(
            root,
            tmp.path().join("project-config.json"),
            tmp.path().join("mcp.json"),
        ))
    }

    fn fake_agent(tmp: &TempDir, script: &str) -> String {
        let bin = tmp.path().join("fake-agent");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();
        bin.to_string_lossy().into_owned()
    }

    async fn run_and_collect(
        state: &Arc<Gateway>,
        opts: RunOptions,
        key: String,
    ) -> Vec<ServerFrame> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = spawn_agent(opts, event_tx).await.unwrap();
        state.invocations.insert(key.clone(), handle, 1);

        let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
        let forward = tokio::spawn(forward_invocation(
            state.clone(),
            event_rx,
            outbound_tx,
            key,
            None,
            true,
        ));

        let mut frames = Vec::new();
        while let Some(out) = outbound_rx.recv().await {
            if let Outbound::Frame(frame) = out {
                frames.push(frame);
            }
        }
        forward.await.unwrap();
        frames
    }

    #[tokio::test]
    async fn new_session_flow_orders_frames() {
        let tmp = TempDir::new().unwrap();
        let state = gateway(&tmp);
        let project = tmp.path().join("p");
        std::fs::create_dir_all(&project).unwrap();

        let script = r#"echo '{"session_id":"abc","type":"assistant","message":{"role":"assistant"}}'; exit 0"#;
        let opts = RunOptions {
            agent_bin: Some(fake_agent(&tmp, script)),
            prompt: Some("hello".into()),
            cwd: project,
            store_env: HashMap::new(),
            extra_env: HashMap::new(),
            default_model: "sonnet".into(),
            ..Default::default()
        };

        let frames = run_and_collect(&state, opts, "inv-1".into()).await;

        assert!(matches!(
            &frames[0],
            ServerFrame::SessionCreated { session_id } if session_id == "abc"
        ));
        assert!(matches!(&frames[1], ServerFrame::AgentResponse { .. }));
        assert!(matches!(
            frames.last(),
            Some(ServerFrame::AgentComplete {
                exit_code: 0,
                is_new_session: true
            })
        ));
        // Terminal frame retired the invocation entry
        assert!(state.invocations.is_empty());
    }

    #[tokio::test]
    async fn abort_terminates_and_second_abort_fails() {
        let tmp = TempDir::new().unwrap();
        let state = gateway(&tmp);
        let project = tmp.path().join("p");
        std::fs::create_dir_all(&project).unwrap();

        let opts = RunOptions {
            agent_bin: Some(fake_agent(&tmp, "exec sleep 30")),
            prompt: Some("hello".into()),
            cwd: project,
            store_env: HashMap::new(),
            extra_env: HashMap::new(),
            default_model: "sonnet".into(),
            ..Default::default()
        };

        let (event_tx, event_rx) = mpsc::channel(64);
        let handle = spawn_agent(opts, event_tx).await.unwrap();
        state.invocations.insert("abc".into(), handle, 1);

        let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
        tokio::spawn(forward_invocation(
            state.clone(),
            event_rx,
            outbound_tx,
            "abc".into(),
            Some("abc".into()),
            true,
        ));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(state.invocations.abort("abc"));
        assert!(!state.invocations.abort("abc"));

        let mut saw_complete = false;
        while let Some(out) = outbound_rx.recv().await {
            if let Outbound::Frame(ServerFrame::AgentComplete { exit_code, .. }) = out {
                assert_ne!(exit_code, 0);
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[test]
    fn cwd_resolution_rejects_missing_dirs() {
        let tmp = TempDir::new().unwrap();
        let state = gateway(&tmp);
        let options = CommandOptions {
            project_path: Some("/no/such/dir".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_cwd(&state, &options),
            Err(GatewayError::NotFound(_))
        ));

        let options = CommandOptions::default();
        assert!(matches!(
            resolve_cwd(&state, &options),
            Err(GatewayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cwd_resolution_maps_aliases_to_real_paths() {
        let tmp = TempDir::new().unwrap();
        let state = gateway(&tmp);
        let real = tmp.path().join("workdir");
        std::fs::create_dir_all(&real).unwrap();
        let project = state
            .projects
            .add_manual(real.to_string_lossy().as_ref(), None)
            .unwrap();

        let options = CommandOptions {
            project_path: Some(project.name.clone()),
            ..Default::default()
        };
        assert_eq!(resolve_cwd(&state, &options).unwrap(), real);
    }
}
