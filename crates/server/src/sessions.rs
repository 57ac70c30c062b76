//! Session log reading over append-only NDJSON conversation logs.
//!
//! A session is identified by an agent-assigned id and materialized as
//! lines spread across one or more `.jsonl` files under one project
//! alias. Files are read newest-first; duplicate session ids across files
//! merge with the newest file winning the summary while counts and
//! timestamps merge across all of them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use agentdeck_protocol::{MessagePage, SessionMessage, SessionPage, SessionSummary};

use crate::error::{GatewayError, GatewayResult};
use crate::projects::jsonl_files;

const SUMMARY_MAX_CHARS: usize = 50;
const DEFAULT_SUMMARY: &str = "New Session";
/// User lines carrying slash-command envelopes never become titles
const COMMAND_PREFIX: &str = "<command-name>";

#[derive(Default)]
struct SessionAccumulator {
    summary_override: Option<String>,
    first_user_text: Option<String>,
    cwd: Option<String>,
    message_count: usize,
    last_activity: Option<String>,
}

/// List merged session summaries, newest activity first, paginated.
pub fn list_sessions(dir: &Path, limit: usize, offset: usize) -> GatewayResult<SessionPage> {
    let mut sessions: HashMap<String, SessionAccumulator> = HashMap::new();

    for path in files_newest_first(dir) {
        accumulate_file(&path, &mut sessions);
    }

    let total = sessions.len();
    let mut summaries: Vec<SessionSummary> = sessions
        .into_iter()
        .map(|(id, acc)| SessionSummary {
            id,
            summary: acc
                .summary_override
                .or_else(|| acc.first_user_text.map(|t| truncate_summary(&t)))
                .unwrap_or_else(|| DEFAULT_SUMMARY.to_string()),
            last_activity: acc.last_activity,
            message_count: acc.message_count,
            cwd: acc.cwd,
        })
        .collect();

    summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

    let page: Vec<SessionSummary> = summaries.into_iter().skip(offset).take(limit).collect();
    Ok(SessionPage {
        sessions: page,
        total,
        has_more: offset + limit < total,
    })
}

/// Chronological messages for one session. With a limit, the slice is
/// anchored at the tail and `offset` counts back from the newest message.
pub fn get_messages(
    dir: &Path,
    session_id: &str,
    limit: Option<usize>,
    offset: usize,
) -> GatewayResult<MessagePage> {
    let mut messages: Vec<SessionMessage> = Vec::new();
    let mut found = false;

    for path in files_newest_first(dir) {
        for value in parsed_lines(&path) {
            if value.get("sessionId").and_then(|v| v.as_str()) != Some(session_id) {
                continue;
            }
            found = true;
            let Ok(message) = serde_json::from_value::<SessionMessage>(value) else {
                continue;
            };
            if message
                .message
                .as_ref()
                .is_some_and(|body| body.is_conversational())
            {
                messages.push(message);
            }
        }
    }

    if !found {
        return Err(GatewayError::not_found(format!(
            "unknown session: {session_id}"
        )));
    }

    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let total = messages.len();

    let (slice, has_more) = match limit {
        None => (messages, false),
        Some(limit) => {
            let end = total.saturating_sub(offset);
            let start = end.saturating_sub(limit);
            (
                messages[start..end].to_vec(),
                offset + limit < total,
            )
        }
    };

    Ok(MessagePage {
        messages: slice,
        total,
        has_more,
    })
}

/// Remove every line of a session from every log that contains it.
/// Files without the session stay byte-identical; malformed lines are
/// preserved verbatim in rewrites.
pub fn delete_session(dir: &Path, session_id: &str) -> GatewayResult<()> {
    let mut found = false;

    for path in jsonl_files(dir) {
        let Ok(body) = fs::read_to_string(&path) else {
            continue;
        };

        let mut kept: Vec<&str> = Vec::new();
        let mut removed = 0usize;
        for line in body.lines() {
            let is_target = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| {
                    v.get("sessionId")
                        .and_then(|s| s.as_str())
                        .map(|s| s == session_id)
                })
                .unwrap_or(false);
            if is_target {
                removed += 1;
            } else {
                kept.push(line);
            }
        }

        if removed == 0 {
            continue;
        }
        found = true;

        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        fs::write(&path, rewritten)?;
    }

    if !found {
        return Err(GatewayError::not_found(format!(
            "unknown session: {session_id}"
        )));
    }
    Ok(())
}

/// Distinct session ids across every log under the alias directory.
pub fn distinct_session_count(dir: &Path) -> usize {
    let mut seen = std::collections::HashSet::new();
    for path in jsonl_files(dir) {
        for value in parsed_lines(&path) {
            if let Some(sid) = value.get("sessionId").and_then(|v| v.as_str()) {
                seen.insert(sid.to_string());
            }
        }
    }
    seen.len()
}

// -- Internals --------------------------------------------------------------

fn files_newest_first(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = jsonl_files(dir)
        .into_iter()
        .map(|p| {
            let mtime = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            (p, mtime)
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1));
    files.into_iter().map(|(p, _)| p).collect()
}

/// All parseable JSON lines of a file, skipping malformed ones with a
/// single warning.
fn parsed_lines(path: &Path) -> Vec<Value> {
    let Ok(body) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut values = Vec::new();
    let mut malformed = 0usize;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => values.push(value),
            Err(_) => malformed += 1,
        }
    }
    if malformed > 0 {
        warn!(
            component = "sessions",
            event = "sessions.log.malformed_lines",
            path = %path.display(),
            skipped = malformed,
            "Skipped unparseable log lines"
        );
    }
    values
}

fn accumulate_file(path: &Path, sessions: &mut HashMap<String, SessionAccumulator>) {
    for value in parsed_lines(path) {
        let Some(sid) = value.get("sessionId").and_then(|v| v.as_str()) else {
            continue;
        };
        let acc = sessions.entry(sid.to_string()).or_default();

        if value.get("type").and_then(|v| v.as_str()) == Some("summary") {
            if acc.summary_override.is_none() {
                if let Some(text) = value.get("summary").and_then(|v| v.as_str()) {
                    acc.summary_override = Some(text.to_string());
                }
            }
        }

        if acc.cwd.is_none() {
            if let Some(cwd) = value.get("cwd").and_then(|v| v.as_str()) {
                acc.cwd = Some(cwd.to_string());
            }
        }

        if let Some(ts) = value.get("timestamp").and_then(|v| v.as_str()) {
            if acc.last_activity.as_deref().map_or(true, |cur| ts > cur) {
                acc.last_activity = Some(ts.to_string());
            }
        }

        let Some(message) = value.get("message") else {
            continue;
        };
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("");
        if role != "user" && role != "assistant" {
            continue;
        }
        acc.message_count += 1;

        if role == "user" && acc.first_user_text.is_none() {
            if let Some(text) = first_text(message) {
                if !text.starts_with(COMMAND_PREFIX) {
                    acc.first_user_text = Some(text);
                }
            }
        }
    }
}

fn first_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => parts.iter().find_map(|part| {
            (part.get("type").and_then(|v| v.as_str()) == Some("text"))
                .then(|| part.get("text").and_then(|v| v.as_str()).map(String::from))
                .flatten()
        }),
        _ => None,
    }
}

fn truncate_summary(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SUMMARY_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user_line(sid: &str, text: &str, ts: &str) -> String {
        format!(
            r#"{{"sessionId":"{sid}","timestamp":"{ts}","cwd":"/tmp/p","message":{{"role":"user","content":"{text}"}}}}"#
        )
    }

    fn assistant_line(sid: &str, text: &str, ts: &str) -> String {
        format!(
            r#"{{"sessionId":"{sid}","timestamp":"{ts}","message":{{"role":"assistant","content":[{{"type":"text","text":"{text}"}}]}}}}"#
        )
    }

    fn write(dir: &Path, name: &str, lines: &[String]) {
        fs::write(dir.join(name), lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn summaries_merge_across_files() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[
                user_line("x", "first question", "2026-01-01T10:00:00Z"),
                assistant_line("x", "answer", "2026-01-01T10:00:05Z"),
            ],
        );
        write(
            tmp.path(),
            "b.jsonl",
            &[assistant_line("x", "more", "2026-01-02T09:00:00Z")],
        );

        let page = list_sessions(tmp.path(), 10, 0).unwrap();
        assert_eq!(page.total, 1);
        let s = &page.sessions[0];
        assert_eq!(s.message_count, 3);
        assert_eq!(s.last_activity.as_deref(), Some("2026-01-02T09:00:00Z"));
        assert_eq!(s.summary, "first question");
    }

    #[test]
    fn summary_line_overrides_first_user_message() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[
                user_line("x", "raw title", "2026-01-01T10:00:00Z"),
                r#"{"sessionId":"x","type":"summary","summary":"Curated title"}"#.to_string(),
            ],
        );
        let page = list_sessions(tmp.path(), 10, 0).unwrap();
        assert_eq!(page.sessions[0].summary, "Curated title");
    }

    #[test]
    fn command_prefixed_lines_do_not_become_titles() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[
                user_line("x", "<command-name>clear</command-name>", "2026-01-01T10:00:00Z"),
                user_line("x", "real question", "2026-01-01T10:01:00Z"),
            ],
        );
        let page = list_sessions(tmp.path(), 10, 0).unwrap();
        assert_eq!(page.sessions[0].summary, "real question");
    }

    #[test]
    fn long_titles_truncate_at_fifty_chars() {
        let tmp = TempDir::new().unwrap();
        let long = "a".repeat(80);
        write(
            tmp.path(),
            "a.jsonl",
            &[user_line("x", &long, "2026-01-01T10:00:00Z")],
        );
        let page = list_sessions(tmp.path(), 10, 0).unwrap();
        assert_eq!(page.sessions[0].summary, format!("{}...", "a".repeat(50)));
    }

    #[test]
    fn pagination_reports_totals() {
        let tmp = TempDir::new().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|i| user_line(&format!("s{i}"), "q", &format!("2026-01-0{}T00:00:00Z", i + 1)))
            .collect();
        write(tmp.path(), "a.jsonl", &lines);

        let page = list_sessions(tmp.path(), 2, 0).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.sessions.len(), 2);
        assert!(page.has_more);
        // Newest first
        assert_eq!(page.sessions[0].id, "s4");

        let page = list_sessions(tmp.path(), 2, 4).unwrap();
        assert_eq!(page.sessions.len(), 1);
        assert!(!page.has_more);
    }

    #[test]
    fn messages_slice_from_the_tail() {
        let tmp = TempDir::new().unwrap();
        let lines: Vec<String> = (0..10)
            .map(|i| user_line("x", &format!("m{i}"), &format!("2026-01-01T00:00:{i:02}Z")))
            .collect();
        write(tmp.path(), "a.jsonl", &lines);

        let all = get_messages(tmp.path(), "x", None, 0).unwrap();
        assert_eq!(all.total, 10);
        assert_eq!(all.messages.len(), 10);
        assert!(!all.has_more);

        let tail = get_messages(tmp.path(), "x", Some(3), 0).unwrap();
        let texts: Vec<_> = tail
            .messages
            .iter()
            .map(|m| m.message.as_ref().unwrap().first_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["m7", "m8", "m9"]);
        assert!(tail.has_more);

        let earlier = get_messages(tmp.path(), "x", Some(3), 3).unwrap();
        let texts: Vec<_> = earlier
            .messages
            .iter()
            .map(|m| m.message.as_ref().unwrap().first_text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["m4", "m5", "m6"]);
    }

    #[test]
    fn non_conversational_lines_are_not_messages() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[
                r#"{"sessionId":"x","timestamp":"2026-01-01T00:00:00Z","type":"progress"}"#
                    .to_string(),
                user_line("x", "hello", "2026-01-01T00:00:01Z"),
            ],
        );
        let page = get_messages(tmp.path(), "x", None, 0).unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn delete_rewrites_only_files_containing_the_session() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[user_line("keep", "untouched", "2026-01-01T00:00:00Z")],
        );
        write(
            tmp.path(),
            "b.jsonl",
            &[
                user_line("x", "bye", "2026-01-01T00:00:00Z"),
                user_line("keep", "stays", "2026-01-01T00:00:01Z"),
            ],
        );
        let a_before = fs::read(tmp.path().join("a.jsonl")).unwrap();

        delete_session(tmp.path(), "x").unwrap();

        assert_eq!(fs::read(tmp.path().join("a.jsonl")).unwrap(), a_before);
        let b = fs::read_to_string(tmp.path().join("b.jsonl")).unwrap();
        assert!(!b.contains("\"x\""));
        assert!(b.ends_with('\n'));

        let page = list_sessions(tmp.path(), 10, 0).unwrap();
        assert!(page.sessions.iter().all(|s| s.id != "x"));
    }

    #[test]
    fn delete_unknown_session_fails_and_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[user_line("keep", "hello", "2026-01-01T00:00:00Z")],
        );
        let before = fs::read(tmp.path().join("a.jsonl")).unwrap();

        assert!(matches!(
            delete_session(tmp.path(), "nope"),
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(fs::read(tmp.path().join("a.jsonl")).unwrap(), before);
    }

    #[test]
    fn malformed_lines_survive_a_delete_rewrite() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "a.jsonl",
            &[
                "{this is not json".to_string(),
                user_line("x", "bye", "2026-01-01T00:00:00Z"),
            ],
        );
        delete_session(tmp.path(), "x").unwrap();
        let body = fs::read_to_string(tmp.path().join("a.jsonl")).unwrap();
        assert_eq!(body, "{this is not json\n");
    }
}
