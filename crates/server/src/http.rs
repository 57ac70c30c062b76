//! REST surface over the env store, project registry, session logs, and
//! the path sandbox. All JSON; failures map through `GatewayError`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use agentdeck_protocol::{EnvVar, Project};

use crate::error::{GatewayError, GatewayResult};
use crate::sandbox;
use crate::sessions;
use crate::state::Gateway;
use crate::websocket::ws_handler;

pub fn router(state: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/env", get(list_env).post(set_env))
        .route("/api/env/bulk", post(bulk_set_env))
        .route("/api/env/{key}", get(get_env).delete(delete_env))
        .route("/api/projects", get(list_projects).post(add_project))
        .route(
            "/api/projects/{alias}",
            axum::routing::put(rename_project).delete(delete_project),
        )
        .route("/api/projects/{alias}/sessions", get(list_sessions))
        .route(
            "/api/projects/{alias}/sessions/{session_id}",
            axum::routing::delete(delete_session),
        )
        .route(
            "/api/projects/{alias}/sessions/{session_id}/messages",
            get(get_messages),
        )
        .route(
            "/api/projects/{alias}/file",
            get(read_project_file).put(write_project_file),
        )
        .route("/api/file", get(read_absolute_file))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    "OK"
}

// -- Env vars (C1) -----------------------------------------------------------

async fn list_env(State(state): State<Arc<Gateway>>) -> Json<Vec<EnvVar>> {
    Json(state.env.list())
}

async fn get_env(
    State(state): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> GatewayResult<Json<EnvVar>> {
    state
        .env
        .get(&key)
        .map(Json)
        .ok_or_else(|| GatewayError::not_found(format!("unknown env var: {key}")))
}

#[derive(Deserialize)]
struct SetEnvBody {
    key: String,
    value: String,
    description: Option<String>,
}

async fn set_env(
    State(state): State<Arc<Gateway>>,
    Json(body): Json<SetEnvBody>,
) -> GatewayResult<Json<EnvVar>> {
    state
        .env
        .set(&body.key, body.value, body.description)
        .map(Json)
}

#[derive(Deserialize)]
struct BulkSetBody {
    vars: HashMap<String, String>,
}

async fn bulk_set_env(
    State(state): State<Arc<Gateway>>,
    Json(body): Json<BulkSetBody>,
) -> GatewayResult<Json<Vec<EnvVar>>> {
    state.env.bulk_set(body.vars).map(Json)
}

async fn delete_env(
    State(state): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    if state.env.delete(&key) {
        Ok(Json(json!({ "deleted": key })))
    } else {
        Err(GatewayError::not_found(format!("unknown env var: {key}")))
    }
}

// -- Projects (C2) -----------------------------------------------------------

async fn list_projects(State(state): State<Arc<Gateway>>) -> Json<Vec<Project>> {
    Json(state.projects.discover())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddProjectBody {
    path: String,
    display_name: Option<String>,
}

async fn add_project(
    State(state): State<Arc<Gateway>>,
    Json(body): Json<AddProjectBody>,
) -> GatewayResult<Json<Project>> {
    state.projects.add_manual(&body.path, body.display_name).map(Json)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody {
    display_name: String,
}

async fn rename_project(
    State(state): State<Arc<Gateway>>,
    Path(alias): Path<String>,
    Json(body): Json<RenameBody>,
) -> GatewayResult<Json<serde_json::Value>> {
    state.projects.rename(&alias, &body.display_name)?;
    Ok(Json(json!({ "renamed": alias })))
}

async fn delete_project(
    State(state): State<Arc<Gateway>>,
    Path(alias): Path<String>,
) -> GatewayResult<Json<serde_json::Value>> {
    state.projects.delete(&alias)?;
    Ok(Json(json!({ "deleted": alias })))
}

// -- Sessions (C3) -----------------------------------------------------------

#[derive(Deserialize)]
struct Pagination {
    limit: Option<usize>,
    offset: Option<usize>,
}

fn alias_dir(state: &Gateway, alias: &str) -> GatewayResult<PathBuf> {
    let dir = state.projects.agent_root().join(alias);
    if !dir.is_dir() {
        return Err(GatewayError::not_found(format!(
            "unknown project alias: {alias}"
        )));
    }
    Ok(dir)
}

async fn list_sessions(
    State(state): State<Arc<Gateway>>,
    Path(alias): Path<String>,
    Query(page): Query<Pagination>,
) -> GatewayResult<impl IntoResponse> {
    let dir = alias_dir(&state, &alias)?;
    let result = sessions::list_sessions(&dir, page.limit.unwrap_or(20), page.offset.unwrap_or(0))?;
    Ok(Json(result))
}

async fn get_messages(
    State(state): State<Arc<Gateway>>,
    Path((alias, session_id)): Path<(String, String)>,
    Query(page): Query<Pagination>,
) -> GatewayResult<impl IntoResponse> {
    let dir = alias_dir(&state, &alias)?;
    let result =
        sessions::get_messages(&dir, &session_id, page.limit, page.offset.unwrap_or(0))?;
    Ok(Json(result))
}

async fn delete_session(
    State(state): State<Arc<Gateway>>,
    Path((alias, session_id)): Path<(String, String)>,
) -> GatewayResult<Json<serde_json::Value>> {
    let dir = alias_dir(&state, &alias)?;
    sessions::delete_session(&dir, &session_id)?;
    Ok(Json(json!({ "deleted": session_id })))
}

// -- Files (C7) ---------------------------------------------------------------

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn read_project_file(
    State(state): State<Arc<Gateway>>,
    Path(alias): Path<String>,
    Query(query): Query<FileQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = state.projects.resolve_alias(&alias)?;
    let resolved = sandbox::resolve_project_relative(&root, &query.path)?;
    let content = std::fs::read_to_string(&resolved)?;
    Ok(Json(json!({
        "path": resolved.to_string_lossy(),
        "content": content,
    })))
}

#[derive(Deserialize)]
struct WriteFileBody {
    content: String,
}

async fn write_project_file(
    State(state): State<Arc<Gateway>>,
    Path(alias): Path<String>,
    Query(query): Query<FileQuery>,
    Json(body): Json<WriteFileBody>,
) -> GatewayResult<Json<serde_json::Value>> {
    let root = state.projects.resolve_alias(&alias)?;
    let resolved = sandbox::resolve_project_relative(&root, &query.path)?;
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&resolved, body.content)?;
    Ok(Json(json!({ "saved": resolved.to_string_lossy() })))
}

async fn read_absolute_file(
    Query(query): Query<FileQuery>,
) -> GatewayResult<Json<serde_json::Value>> {
    let resolved = sandbox::resolve_absolute(&query.path)?;
    let content = std::fs::read_to_string(&resolved)?;
    Ok(Json(json!({
        "path": resolved.to_string_lossy(),
        "content": content,
    })))
}
