//! Agent subprocess lifecycle.
//!
//! One spawn per run frame. The child is owned by its reaper task; the
//! gateway holds an `AgentHandle` and aborts by signalling, never by
//! reaching into the child directly. Event order is guaranteed: stdout
//! frames in emission order, `SessionCaptured` before the `Response` that
//! carried the id, `Complete` strictly last.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::args::{build_args, declares_mcp_servers};
use crate::env::build_child_env;
use crate::images::materialize_images;
use crate::{resolve_agent_binary, RunOptions, RunnerError, RunnerEvent};

/// Handle to a live invocation. Cheap to clone; dropping it does not
/// affect the child.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub pid: u32,
    kill_tx: mpsc::Sender<()>,
}

impl AgentHandle {
    /// Request cooperative termination. SIGTERM on unix; elsewhere the
    /// reaper kills the child through its cancellation channel.
    pub fn signal_terminate(&self) -> bool {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                return true;
            }
            warn!(
                component = "runner",
                event = "runner.abort.signal_failed",
                pid = self.pid,
                "SIGTERM delivery failed, falling back to kill channel"
            );
        }
        self.kill_tx.try_send(()).is_ok()
    }
}

/// Spawn the agent and start its stdout/stderr pumps and reaper.
///
/// Events flow into `events` in emission order; `RunnerEvent::Complete`
/// is always the final send. Temp image files are removed when the child
/// exits, on the error path included.
pub async fn spawn_agent(
    opts: RunOptions,
    events: mpsc::Sender<RunnerEvent>,
) -> Result<AgentHandle, RunnerError> {
    let agent_bin = match opts.agent_bin.clone() {
        Some(bin) => bin,
        None => resolve_agent_binary()?,
    };

    let temp_images = materialize_images(&opts.cwd, &opts.images)?;

    let mcp_config = opts.mcp_config.as_deref().filter(|path| {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .map(|cfg| declares_mcp_servers(&cfg, &opts.cwd))
            .unwrap_or(false)
    });

    let args = build_args(&opts, &temp_images.paths, mcp_config);
    let child_env = build_child_env(&opts.store_env, &opts.extra_env);

    info!(
        component = "runner",
        event = "runner.spawn",
        agent_bin = %agent_bin,
        cwd = %opts.cwd.display(),
        resume = opts.resume,
        session_id = ?opts.session_id,
        image_count = temp_images.paths.len(),
        "Spawning agent CLI"
    );

    let mut child = match tokio::process::Command::new(&agent_bin)
        .args(&args)
        .current_dir(&opts.cwd)
        .env_clear()
        .envs(&child_env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            temp_images.cleanup();
            return Err(RunnerError::SpawnFailed(e.to_string()));
        }
    };

    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            temp_images.cleanup();
            return Err(RunnerError::SpawnFailed("child exited before start".into()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::SpawnFailed("no stdout on child".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::SpawnFailed("no stderr on child".into()))?;
    let mut stdin = child.stdin.take();

    // Stdin: print mode closes immediately; an inline command is written
    // once; otherwise the pipe stays open for interactive use until exit.
    if opts.prompt.is_some() {
        drop(stdin.take());
    } else if let Some(command) = opts.stdin_command.clone() {
        if let Some(mut pipe) = stdin.take() {
            tokio::spawn(async move {
                let mut line = command;
                line.push('\n');
                if let Err(e) = pipe.write_all(line.as_bytes()).await {
                    warn!(
                        component = "runner",
                        event = "runner.stdin.write_failed",
                        error = %e,
                        "Failed to write inline command to agent stdin"
                    );
                }
                let _ = pipe.flush().await;
            });
        }
    }

    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

    // Stdout pump: newline-split, JSON per line, raw fallback.
    let stdout_events = events.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut captured_session = false;
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(parsed) => {
                    if !captured_session {
                        if let Some(sid) = parsed.get("session_id").and_then(|v| v.as_str()) {
                            captured_session = true;
                            if stdout_events
                                .send(RunnerEvent::SessionCaptured {
                                    session_id: sid.to_string(),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    if stdout_events
                        .send(RunnerEvent::Response(parsed))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(_) => {
                    if stdout_events.send(RunnerEvent::Output(line)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    // Stderr pump: every chunk forwarded, child keeps running.
    let stderr_events = events.clone();
    let stderr_task = tokio::spawn(async move {
        let mut reader = stderr;
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if stderr_events
                        .send(RunnerEvent::Stderr(chunk))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // Reaper: owns the child and the open stdin pipe, waits for exit,
    // drains the pumps, cleans temp files, then emits the terminal event.
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx.recv() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        drop(stdin);

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        temp_images.cleanup();

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(
                    component = "runner",
                    event = "runner.wait_failed",
                    pid = pid,
                    error = %e,
                    "Failed to await agent exit"
                );
                let _ = events
                    .send(RunnerEvent::Stderr(format!("wait failed: {e}")))
                    .await;
                -1
            }
        };

        debug!(
            component = "runner",
            event = "runner.exited",
            pid = pid,
            exit_code = exit_code,
            "Agent exited"
        );
        let _ = events.send(RunnerEvent::Complete { exit_code }).await;
    });

    Ok(AgentHandle { pid, kill_tx })
}
