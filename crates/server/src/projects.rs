//! Project discovery and aliasing.
//!
//! A project is identified by an alias: its real absolute path with the
//! separators replaced by `-`. Aliases name directories under the agent
//! root; a sidecar JSON file carries manually-added projects and display
//! name overrides. Alias to real-path resolution scans the conversation
//! logs for `cwd` values and is memoized for the process lifetime.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agentdeck_protocol::{Project, ProjectOrigin};

use crate::error::{GatewayError, GatewayResult};
use crate::sessions;

/// Directory entries that are never projects
const OS_JUNK: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".localized"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarEntry {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub manually_added: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

type Sidecar = BTreeMap<String, SidecarEntry>;

pub struct ProjectRegistry {
    agent_root: PathBuf,
    sidecar_path: PathBuf,
    /// alias -> real path, write-once-per-alias
    cache: RwLock<HashMap<String, PathBuf>>,
}

impl ProjectRegistry {
    pub fn new(agent_root: PathBuf, sidecar_path: PathBuf) -> Self {
        Self {
            agent_root,
            sidecar_path,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn agent_root(&self) -> &Path {
        &self.agent_root
    }

    /// Encode a real path as an alias.
    pub fn alias_of(path: &Path) -> String {
        path.to_string_lossy().replace(['/', '\\'], "-")
    }

    /// Decode an alias back to a path, the fallback when no log discloses
    /// the real cwd.
    pub fn decode_alias(alias: &str) -> PathBuf {
        PathBuf::from(alias.replace('-', "/"))
    }

    /// Enumerate all known projects: alias directories under the agent
    /// root plus sidecar entries marked manually added.
    pub fn discover(&self) -> Vec<Project> {
        let sidecar = self.load_sidecar();
        let mut aliases: Vec<String> = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.agent_root) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if OS_JUNK.contains(&name.as_str()) {
                    continue;
                }
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    aliases.push(name);
                }
            }
        }

        for (alias, entry) in &sidecar {
            if entry.manually_added && !aliases.contains(alias) {
                aliases.push(alias.clone());
            }
        }
        aliases.sort();

        aliases
            .into_iter()
            .map(|alias| {
                let real = self.resolve_cached(&alias, &sidecar);
                let origin = if sidecar
                    .get(&alias)
                    .map(|e| e.manually_added)
                    .unwrap_or(false)
                {
                    ProjectOrigin::ManuallyAdded
                } else {
                    ProjectOrigin::AgentManaged
                };
                let session_count =
                    sessions::distinct_session_count(&self.agent_root.join(&alias));
                Project {
                    display_name: self.display_name(&alias, &real, &sidecar),
                    name: alias,
                    path: real.to_string_lossy().into_owned(),
                    origin,
                    session_count,
                }
            })
            .collect()
    }

    /// Resolve an alias to its real path. Fails for aliases with neither a
    /// directory under the agent root nor a sidecar entry.
    pub fn resolve_alias(&self, alias: &str) -> GatewayResult<PathBuf> {
        let sidecar = self.load_sidecar();
        if !self.agent_root.join(alias).is_dir() && !sidecar.contains_key(alias) {
            return Err(GatewayError::not_found(format!(
                "unknown project alias: {alias}"
            )));
        }
        Ok(self.resolve_cached(alias, &sidecar))
    }

    /// Register an existing directory as a project.
    pub fn add_manual(&self, path: &str, display_name: Option<String>) -> GatewayResult<Project> {
        let real = PathBuf::from(path);
        if !real.is_dir() {
            return Err(GatewayError::not_found(format!(
                "project path does not exist: {path}"
            )));
        }

        let alias = Self::alias_of(&real);
        let mut sidecar = self.load_sidecar();
        if sidecar.contains_key(&alias) || self.agent_root.join(&alias).is_dir() {
            return Err(GatewayError::conflict(format!(
                "project already exists: {alias}"
            )));
        }

        fs::create_dir_all(self.agent_root.join(&alias))?;
        sidecar.insert(
            alias.clone(),
            SidecarEntry {
                manually_added: true,
                original_path: Some(real.to_string_lossy().into_owned()),
                display_name: display_name.filter(|n| !n.trim().is_empty()),
            },
        );
        self.save_sidecar(&sidecar)?;

        self.cache
            .write()
            .expect("project cache lock poisoned")
            .insert(alias.clone(), real.clone());

        Ok(Project {
            display_name: self.display_name(&alias, &real, &sidecar),
            name: alias,
            path: real.to_string_lossy().into_owned(),
            origin: ProjectOrigin::ManuallyAdded,
            session_count: 0,
        })
    }

    /// Override the display name. An empty name clears the override. Only
    /// the sidecar changes; the alias never does.
    pub fn rename(&self, alias: &str, display_name: &str) -> GatewayResult<()> {
        let mut sidecar = self.load_sidecar();
        if !self.agent_root.join(alias).is_dir() && !sidecar.contains_key(alias) {
            return Err(GatewayError::not_found(format!(
                "unknown project alias: {alias}"
            )));
        }

        let trimmed = display_name.trim();
        let entry = sidecar.entry(alias.to_string()).or_default();
        entry.display_name = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        // Drop entries that no longer carry any information
        if !entry.manually_added && entry.display_name.is_none() && entry.original_path.is_none() {
            sidecar.remove(alias);
        }
        self.save_sidecar(&sidecar)
    }

    /// Remove a project. Only allowed when every log under the alias is
    /// effectively empty; removes the directory and the sidecar entry.
    pub fn delete(&self, alias: &str) -> GatewayResult<()> {
        let dir = self.agent_root.join(alias);
        let mut sidecar = self.load_sidecar();
        if !dir.is_dir() && !sidecar.contains_key(alias) {
            return Err(GatewayError::not_found(format!(
                "unknown project alias: {alias}"
            )));
        }

        if dir.is_dir() {
            for path in jsonl_files(&dir) {
                if file_has_content(&path) {
                    return Err(GatewayError::conflict(format!(
                        "project {alias} still has sessions"
                    )));
                }
            }
            fs::remove_dir_all(&dir)?;
        }

        if sidecar.remove(alias).is_some() {
            self.save_sidecar(&sidecar)?;
        }
        self.cache
            .write()
            .expect("project cache lock poisoned")
            .remove(alias);
        Ok(())
    }

    // -- Resolution ---------------------------------------------------------

    fn resolve_cached(&self, alias: &str, sidecar: &Sidecar) -> PathBuf {
        if let Some(found) = self
            .cache
            .read()
            .expect("project cache lock poisoned")
            .get(alias)
        {
            return found.clone();
        }

        let resolved = self.resolve_fresh(alias, sidecar);
        self.cache
            .write()
            .expect("project cache lock poisoned")
            .entry(alias.to_string())
            .or_insert_with(|| resolved.clone());
        resolved
    }

    fn resolve_fresh(&self, alias: &str, sidecar: &Sidecar) -> PathBuf {
        if let Some(original) = sidecar.get(alias).and_then(|e| e.original_path.as_deref()) {
            return PathBuf::from(original);
        }

        let stats = scan_cwds(&self.agent_root.join(alias));
        if let Some(best) = select_cwd(&stats) {
            debug!(
                component = "projects",
                event = "projects.alias.resolved",
                alias = %alias,
                cwd = %best,
                candidates = stats.len(),
                "Resolved alias from log cwds"
            );
            return PathBuf::from(best);
        }

        Self::decode_alias(alias)
    }

    // -- Display names ------------------------------------------------------

    fn display_name(&self, alias: &str, real: &Path, sidecar: &Sidecar) -> String {
        if let Some(name) = sidecar.get(alias).and_then(|e| e.display_name.clone()) {
            return name;
        }
        if let Some(name) = manifest_name(real) {
            return name;
        }
        if let Some(segment) = real.file_name().and_then(|s| s.to_str()) {
            return segment.to_string();
        }
        Self::decode_alias(alias).to_string_lossy().into_owned()
    }

    // -- Sidecar ------------------------------------------------------------

    fn load_sidecar(&self) -> Sidecar {
        match fs::read_to_string(&self.sidecar_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(
                    component = "projects",
                    event = "projects.sidecar.parse_failed",
                    path = %self.sidecar_path.display(),
                    error = %e,
                    "Ignoring malformed sidecar config"
                );
                Sidecar::new()
            }),
            Err(_) => Sidecar::new(),
        }
    }

    fn save_sidecar(&self, sidecar: &Sidecar) -> GatewayResult<()> {
        if let Some(parent) = self.sidecar_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.sidecar_path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(sidecar)
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.sidecar_path)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct CwdStat {
    count: usize,
    latest: String,
}

/// Collect every `cwd` in the alias directory's logs with its frequency
/// and latest timestamp.
fn scan_cwds(dir: &Path) -> HashMap<String, CwdStat> {
    let mut stats: HashMap<String, CwdStat> = HashMap::new();
    for path in jsonl_files(dir) {
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        for line in BufReader::new(file).lines().map_while(Result::ok) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()) else {
                continue;
            };
            let ts = value
                .get("timestamp")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let stat = stats.entry(cwd.to_string()).or_default();
            stat.count += 1;
            if ts > stat.latest.as_str() {
                stat.latest = ts.to_string();
            }
        }
    }
    stats
}

/// Pick the real cwd: most frequent wins, unless the latest-seen one has
/// at least 30% of the winner's count.
fn select_cwd(stats: &HashMap<String, CwdStat>) -> Option<String> {
    let (most_frequent, freq_stat) = stats
        .iter()
        .max_by(|a, b| (a.1.count, &a.1.latest).cmp(&(b.1.count, &b.1.latest)))?;
    let (latest, latest_stat) = stats
        .iter()
        .max_by(|a, b| (&a.1.latest, a.1.count).cmp(&(&b.1.latest, b.1.count)))?;

    if latest != most_frequent && latest_stat.count * 10 >= freq_stat.count * 3 {
        return Some(latest.clone());
    }
    Some(most_frequent.clone())
}

pub(crate) fn jsonl_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect()
}

fn file_has_content(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(body) => body.lines().any(|l| !l.trim().is_empty()),
        Err(_) => false,
    }
}

/// `name` field of a package.json-style manifest at the project path.
fn manifest_name(real: &Path) -> Option<String> {
    let raw = fs::read_to_string(real.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    manifest
        .get("name")
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(tmp: &TempDir) -> ProjectRegistry {
        let root = tmp.path().join("projects");
        fs::create_dir_all(&root).unwrap();
        ProjectRegistry::new(root, tmp.path().join("project-config.json"))
    }

    fn write_log(dir: &Path, name: &str, lines: &[String]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), lines.join("\n") + "\n").unwrap();
    }

    fn cwd_line(cwd: &str, ts: &str) -> String {
        format!(r#"{{"sessionId":"s1","cwd":"{cwd}","timestamp":"{ts}"}}"#)
    }

    #[test]
    fn alias_round_trips_through_a_log_cwd() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let real = "/home/dev/workspace/app";
        let alias = ProjectRegistry::alias_of(Path::new(real));
        write_log(
            &reg.agent_root().join(&alias),
            "a.jsonl",
            &[cwd_line(real, "2026-01-01T00:00:00Z")],
        );
        assert_eq!(reg.resolve_alias(&alias).unwrap(), PathBuf::from(real));
    }

    #[test]
    fn selection_prefers_recent_cwd_at_thirty_percent() {
        let mut stats = HashMap::new();
        stats.insert(
            "A".to_string(),
            CwdStat {
                count: 10,
                latest: "2026-01-01T00:00:00Z".into(),
            },
        );
        stats.insert(
            "B".to_string(),
            CwdStat {
                count: 3,
                latest: "2026-02-01T00:00:00Z".into(),
            },
        );
        assert_eq!(select_cwd(&stats).as_deref(), Some("B"));

        stats.get_mut("B").unwrap().count = 2;
        assert_eq!(select_cwd(&stats).as_deref(), Some("A"));
    }

    #[test]
    fn alias_decodes_when_no_log_discloses_a_cwd() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        fs::create_dir_all(reg.agent_root().join("-tmp-empty")).unwrap();
        assert_eq!(
            reg.resolve_alias("-tmp-empty").unwrap(),
            PathBuf::from("/tmp/empty")
        );
    }

    #[test]
    fn manual_add_requires_an_existing_path() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        assert!(matches!(
            reg.add_manual("/definitely/not/here", None),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn manual_add_then_duplicate_conflicts() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let target = tmp.path().join("workdir");
        fs::create_dir_all(&target).unwrap();
        let path = target.to_string_lossy().into_owned();

        let project = reg.add_manual(&path, Some("Work".into())).unwrap();
        assert_eq!(project.origin, ProjectOrigin::ManuallyAdded);
        assert_eq!(project.display_name, "Work");
        assert!(matches!(
            reg.add_manual(&path, None),
            Err(GatewayError::Conflict(_))
        ));
    }

    #[test]
    fn rename_touches_only_the_sidecar() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        fs::create_dir_all(reg.agent_root().join("-tmp-p")).unwrap();

        reg.rename("-tmp-p", "Friendly").unwrap();
        let projects = reg.discover();
        let p = projects.iter().find(|p| p.name == "-tmp-p").unwrap();
        assert_eq!(p.display_name, "Friendly");

        // Clearing the override falls back to the path segment
        reg.rename("-tmp-p", "").unwrap();
        let projects = reg.discover();
        let p = projects.iter().find(|p| p.name == "-tmp-p").unwrap();
        assert_eq!(p.display_name, "p");
    }

    #[test]
    fn delete_refuses_projects_with_sessions() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let dir = reg.agent_root().join("-tmp-busy");
        write_log(&dir, "s.jsonl", &[cwd_line("/tmp/busy", "2026-01-01T00:00:00Z")]);

        assert!(matches!(
            reg.delete("-tmp-busy"),
            Err(GatewayError::Conflict(_))
        ));

        // Blank lines do not count as content
        fs::write(dir.join("s.jsonl"), "\n\n").unwrap();
        reg.delete("-tmp-busy").unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn display_name_prefers_manifest_over_path_segment() {
        let tmp = TempDir::new().unwrap();
        let reg = registry(&tmp);
        let target = tmp.path().join("app");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("package.json"), r#"{"name":"my-app"}"#).unwrap();

        let project = reg
            .add_manual(target.to_string_lossy().as_ref(), None)
            .unwrap();
        assert_eq!(project.display_name, "my-app");
    }
}
