//! Argument assembly for the agent CLI.
//!
//! The order of flags is normative: the agent rejects some combinations
//! when reordered, so every step below appends in sequence and nothing
//! else touches the vector.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::RunOptions;

/// Tools merged into the allow list when running in plan mode
const PLAN_MODE_TOOLS: &[&str] = &["Read", "Task", "exit_plan_mode", "TodoRead", "TodoWrite"];

/// Build the full agent argv (without the binary itself).
///
/// `image_paths` are the already-materialized temp files appended to the
/// prompt; `mcp_config` is the tool-config path, included only when the
/// caller verified it declares at least one server.
pub fn build_args(
    opts: &RunOptions,
    image_paths: &[std::path::PathBuf],
    mcp_config: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    // 1. Prompt, with the image-paths block appended when attachments exist
    if let Some(prompt) = &opts.prompt {
        args.push("--print".into());
        args.push(prompt_with_images(prompt, image_paths));
    }

    // 2. Resume a known session
    if opts.resume {
        if let Some(sid) = &opts.session_id {
            args.push("--resume".into());
            args.push(sid.clone());
        }
    }

    // 3. Streaming output, always
    args.push("--output-format".into());
    args.push("stream-json".into());
    args.push("--verbose".into());

    // 4. MCP tool config
    if let Some(path) = mcp_config {
        args.push("--mcp-config".into());
        args.push(path.to_string_lossy().into_owned());
    }

    // 5. Fixed default model for fresh invocations only
    if !opts.resume {
        args.push("--model".into());
        args.push(opts.default_model.clone());
    }

    // 6. Permission mode, forwarded opaquely
    let mode = opts.permission_mode.as_deref().unwrap_or("default");
    if mode != "default" {
        args.push("--permission-mode".into());
        args.push(mode.into());
    }

    // 7. Tool policy
    if opts.skip_permissions && mode != "plan" {
        args.push("--dangerously-skip-permissions".into());
    } else {
        let mut allowed: Vec<String> = opts.allowed_tools.clone();
        if mode == "plan" {
            for tool in PLAN_MODE_TOOLS {
                if !allowed.iter().any(|t| t == tool) {
                    allowed.push((*tool).into());
                }
            }
        }
        for tool in &allowed {
            args.push("--allowedTools".into());
            args.push(tool.clone());
        }
        for tool in &opts.disallowed_tools {
            args.push("--disallowedTools".into());
            args.push(tool.clone());
        }
    }

    debug!(
        component = "runner",
        event = "runner.args.built",
        arg_count = args.len(),
        resume = opts.resume,
        "Agent argv assembled"
    );

    args
}

fn prompt_with_images(prompt: &str, image_paths: &[std::path::PathBuf]) -> String {
    if image_paths.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from(prompt);
    out.push_str("\n\n[Images provided at the following paths:]");
    for (i, path) in image_paths.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", i + 1, path.display()));
    }
    out
}

/// True when the tool config declares at least one MCP server, either
/// globally or scoped to `cwd`.
pub fn declares_mcp_servers(config: &Value, cwd: &Path) -> bool {
    let non_empty_object = |v: &Value| v.as_object().is_some_and(|m| !m.is_empty());

    if config.get("mcpServers").is_some_and(&non_empty_object) {
        return true;
    }

    config
        .get("projects")
        .and_then(|projects| projects.get(cwd.to_string_lossy().as_ref()))
        .and_then(|scoped| scoped.get("mcpServers"))
        .is_some_and(&non_empty_object)
}
