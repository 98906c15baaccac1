use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{Message, SessionWithCount, User};

use super::router::AppState;

/// Token validation is out of scope here; this layer trusts whatever
/// identity the bearer token carries and treats it as the user id directly.
fn require_user_id(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Config("missing or malformed Authorization header".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply_text: String,
    pub session_id: String,
    pub message_id: String,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> AppResult<Json<ChatResponse>> {
    let user_id = require_user_id(&headers)?;
    let out = state
        .orchestrator
        .respond(&user_id, body.session_id.as_deref(), &body.text)
        .await?;
    Ok(Json(ChatResponse {
        reply_text: out.reply_text,
        session_id: out.session_id,
        message_id: out.message_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<SessionWithCount>>> {
    let user_id = require_user_id(&headers)?;
    Ok(Json(state.store.list_sessions(&user_id).await?))
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionRequest>,
) -> AppResult<Json<crate::models::Session>> {
    let user_id = require_user_id(&headers)?;
    state.store.get_or_create_user(&user_id).await?;
    let mut session = crate::models::Session::new(&user_id);
    session.metadata = body.metadata;
    state.store.create_session(&session).await?;
    Ok(Json(session))
}

pub async fn session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(state.store.list_messages_by_session(&session_id).await?))
}

pub async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<Option<crate::models::Profile>>> {
    let user_id = require_user_id(&headers)?;
    Ok(Json(state.store.latest_profile(&user_id).await?))
}

#[derive(Debug, Serialize)]
pub struct AnalysisStatus {
    pub total_summaries: usize,
    pub profile_refresh_due: bool,
    pub latest_profile_version: Option<i64>,
}

pub async fn analysis_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<AnalysisStatus>> {
    let user_id = require_user_id(&headers)?;
    let summaries = state.store.list_summaries(&user_id, None).await?;
    let profile = state.store.latest_profile(&user_id).await?;
    let refresh_due = state.retrieval.profile_refresh_due(&user_id).await?;
    Ok(Json(AnalysisStatus {
        total_summaries: summaries.len(),
        profile_refresh_due: refresh_due,
        latest_profile_version: profile.map(|p| p.version),
    }))
}

pub async fn get_user(State(state): State<Arc<AppState>>, headers: HeaderMap) -> AppResult<Json<User>> {
    let user_id = require_user_id(&headers)?;
    Ok(Json(state.store.get_or_create_user(&user_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserNameRequest {
    pub name: String,
}

pub async fn update_user_name(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateUserNameRequest>,
) -> AppResult<Json<User>> {
    let user_id = require_user_id(&headers)?;
    state.store.update_user_name(&user_id, &body.name).await?;
    let user = state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("user {user_id} vanished after update")))?;
    Ok(Json(user))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
