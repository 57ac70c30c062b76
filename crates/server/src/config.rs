//! CLI arguments, `.env`-style startup configuration, and the on-disk
//! layout of the agent's data directory.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3001;

/// Where the agent keeps its data. Resolved once at startup and owned by
/// the gateway; nothing global.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    claude_dir: PathBuf,
}

impl AgentPaths {
    /// Resolution order: CLI `--data-dir`, then `AGENTDECK_CLAUDE_DIR`,
    /// then `~/.claude`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let claude_dir = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("AGENTDECK_CLAUDE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".claude")
            });
        Self { claude_dir }
    }

    pub fn claude_dir(&self) -> &Path {
        &self.claude_dir
    }

    /// The agent root: per-project conversation log directories.
    pub fn projects_root(&self) -> PathBuf {
        self.claude_dir.join("projects")
    }

    /// Sidecar config for manually-added and renamed projects.
    pub fn sidecar(&self) -> PathBuf {
        self.claude_dir.join("project-config.json")
    }

    /// Optional MCP tool config consulted at spawn time. Lives next to
    /// the data dir in the home directory unless overridden.
    pub fn mcp_config(&self) -> PathBuf {
        if let Some(path) = std::env::var_os("AGENTDECK_MCP_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude.json")
    }

    /// Create the agent root if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.projects_root())
    }
}

#[derive(Debug, Parser)]
#[command(name = "agentdeck-server", about = "Gateway between a browser UI and the agent CLI")]
pub struct Cli {
    /// Port to bind; overrides the PORT environment variable
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to a .env-style file loaded at startup
    #[arg(short, long)]
    pub env: Option<PathBuf>,

    /// Agent data directory (default: ~/.claude)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

impl Cli {
    /// Bound port: `--port` > `PORT` env > default.
    pub fn resolved_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }
}

/// Load a `.env`-style file into the process environment. Existing
/// variables are not overwritten. Returns how many were applied.
pub fn load_env_file(path: &Path) -> std::io::Result<usize> {
    let body = std::fs::read_to_string(path)?;
    let mut applied = 0usize;
    for (key, value) in parse_env_lines(&body) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, &value);
            applied += 1;
        }
    }
    Ok(applied)
}

/// Try `./.env` when no explicit file was given; silence is fine.
pub fn load_default_env_file() {
    let default = Path::new(".env");
    if default.is_file() {
        if let Err(e) = load_env_file(default) {
            warn!(
                component = "config",
                event = "config.env_file.failed",
                error = %e,
                "Failed to load ./.env"
            );
        }
    }
}

/// Parse `KEY=VALUE` lines: blank lines and `#` comments skipped, single
/// or double quotes around the value stripped.
fn parse_env_lines(body: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_wins_over_defaults() {
        let paths = AgentPaths::resolve(Some(Path::new("/srv/agent")));
        assert_eq!(paths.claude_dir(), Path::new("/srv/agent"));
        assert_eq!(paths.projects_root(), PathBuf::from("/srv/agent/projects"));
        assert_eq!(
            paths.sidecar(),
            PathBuf::from("/srv/agent/project-config.json")
        );
    }

    #[test]
    fn env_lines_parse_with_comments_and_quotes() {
        let body = r#"
# gateway settings
PORT=4005
NAME="quoted value"
SINGLE='single'
BROKEN LINE
=novalue
EMPTY=
"#;
        let pairs = parse_env_lines(body);
        assert_eq!(
            pairs,
            vec![
                ("PORT".to_string(), "4005".to_string()),
                ("NAME".to_string(), "quoted value".to_string()),
                ("SINGLE".to_string(), "single".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn port_precedence_prefers_the_flag() {
        let cli = Cli {
            port: Some(9000),
            env: None,
            data_dir: None,
        };
        assert_eq!(cli.resolved_port(), 9000);

        let cli = Cli {
            port: None,
            env: None,
            data_dir: None,
        };
        // With neither flag nor PORT set, the default applies
        std::env::remove_var("PORT");
        assert_eq!(cli.resolved_port(), DEFAULT_PORT);
    }
}
