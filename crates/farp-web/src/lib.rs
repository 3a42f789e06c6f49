//! Axum JSON API: sync trigger entry points, the read API, and the
//! bearer-token auth boundary.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use farp_core::{ExternalIds, FacultyProfile, RecordKind};
use farp_store::{PortfolioStore, StoreError};
use farp_sync::{SyncError, SyncService, SyncTrigger};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "farp-web";

/// Session issuance lives outside this system; the API only needs to map an
/// opaque bearer token to the user it belongs to.
pub trait AccessTokens: Send + Sync {
    fn user_for_token(&self, token: &str) -> Option<String>;
}

/// Fixed token table, configured at startup.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    /// Parse a `token:user,token:user` spec, as passed via `FARP_API_TOKENS`.
    pub fn from_spec(spec: &str) -> Self {
        let mut tokens = Self::new();
        for pair in spec.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once(':') {
                Some((token, user_id)) if !token.is_empty() && !user_id.is_empty() => {
                    tokens.tokens.insert(token.to_string(), user_id.to_string());
                }
                _ => warn!(pair, "ignoring malformed token spec entry"),
            }
        }
        tokens
    }
}

impl AccessTokens for StaticTokens {
    fn user_for_token(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub tokens: Arc<dyn AccessTokens>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, tokens: Arc<dyn AccessTokens>) -> Self {
        Self { service, tokens }
    }

    fn store(&self) -> &PortfolioStore {
        self.service.store()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/setup-profile", post(setup_profile_handler))
        .route("/faculty-data/{user_id}", get(faculty_data_handler))
        .route("/publications/{user_id}", get(publications_handler))
        .route("/conferences/{user_id}", get(conferences_handler))
        .route("/books/{user_id}", get(books_handler))
        .route("/sync-data/{user_id}", post(sync_data_handler))
        .route("/run-weekly-updates", post(run_weekly_updates_handler))
        .route("/scheduler-health", get(scheduler_health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        &format!("store error: {err}"),
    )
}

fn sync_error(err: SyncError) -> Response {
    match err {
        SyncError::ProfileNotFound(_) => json_error(StatusCode::NOT_FOUND, "Profile not found"),
        SyncError::AllSourcesFailed {
            retryable: false, ..
        } => json_error(StatusCode::UNPROCESSABLE_ENTITY, &err.to_string()),
        other => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": other.to_string(), "retryable": true })),
        )
            .into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    bearer_token(headers)
        .and_then(|token| state.tokens.user_for_token(token))
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "Unauthorized"))
}

/// Every per-user route serves the caller's own data only.
fn authorize_owner(caller: &str, user_id: &str) -> Result<(), Response> {
    if caller == user_id {
        Ok(())
    } else {
        Err(json_error(StatusCode::FORBIDDEN, "Access denied"))
    }
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct SetupProfileRequest {
    pub faculty_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub department: Option<String>,
    pub designation: Option<String>,
    pub research_area: Option<String>,
    pub google_scholar_id: Option<String>,
    pub scopus_id: Option<String>,
    pub researcher_id: Option<String>,
    pub orcid_id: Option<String>,
}

async fn setup_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SetupProfileRequest>,
) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let now = Utc::now();

    let existing = match state.store().profile(&caller).await {
        Ok(profile) => profile,
        Err(err) => return store_error(err),
    };
    let mut profile = existing.unwrap_or_else(|| FacultyProfile {
        user_id: caller.clone(),
        faculty_id: String::new(),
        name: String::new(),
        email: String::new(),
        department: None,
        designation: None,
        research_area: None,
        external_ids: ExternalIds::default(),
        profile_setup_complete: false,
        created_at: now,
        updated_at: now,
        last_sync_at: None,
    });

    if let Some(faculty_id) = req.faculty_id {
        profile.faculty_id = faculty_id;
    }
    if let Some(name) = req.name {
        profile.name = name;
    }
    if let Some(email) = req.email {
        profile.email = email;
    }
    if req.department.is_some() {
        profile.department = req.department;
    }
    if req.designation.is_some() {
        profile.designation = req.designation;
    }
    if req.research_area.is_some() {
        profile.research_area = req.research_area;
    }
    if req.google_scholar_id.is_some() {
        profile.external_ids.google_scholar_id = req.google_scholar_id;
    }
    if req.scopus_id.is_some() {
        profile.external_ids.scopus_id = req.scopus_id;
    }
    if req.researcher_id.is_some() {
        profile.external_ids.researcher_id = req.researcher_id;
    }
    if req.orcid_id.is_some() {
        profile.external_ids.orcid_id = req.orcid_id;
    }
    profile.profile_setup_complete = true;
    profile.updated_at = now;

    if let Err(err) = state.store().put_profile(&profile).await {
        return store_error(err);
    }

    if !profile.external_ids.any() {
        return Json(json!({
            "success": true,
            "message": "Profile setup complete",
        }))
        .into_response();
    }

    // One-time synchronous fetch for the new identifiers; also creates the
    // weekly schedule.
    match state
        .service
        .sync_user(&caller, SyncTrigger::InitialSetup, now)
        .await
    {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": "Profile setup complete",
            "outcome": outcome,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn faculty_data_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize_owner(&caller, &user_id) {
        return resp;
    }

    let profile = match state.store().profile(&user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Profile not found"),
        Err(err) => return store_error(err),
    };
    let snapshot = match state.store().stats(&user_id).await {
        Ok(snapshot) => snapshot.unwrap_or_default(),
        Err(err) => return store_error(err),
    };

    Json(json!({
        "profile": profile,
        "academic_stats": snapshot,
    }))
    .into_response()
}

async fn publications_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    records_response(&state, &headers, &user_id, &[RecordKind::Journal], "publications").await
}

async fn conferences_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    records_response(&state, &headers, &user_id, &[RecordKind::Conference], "conferences").await
}

async fn books_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    records_response(
        &state,
        &headers,
        &user_id,
        &[RecordKind::Book, RecordKind::Chapter],
        "books",
    )
    .await
}

async fn records_response(
    state: &AppState,
    headers: &HeaderMap,
    user_id: &str,
    kinds: &[RecordKind],
    field: &str,
) -> Response {
    let caller = match authenticate(state, headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize_owner(&caller, user_id) {
        return resp;
    }

    match state.store().records(user_id).await {
        Ok(records) => {
            let filtered: Vec<_> = records
                .into_iter()
                .filter(|r| kinds.contains(&r.kind))
                .collect();
            Json(json!({ (field): filtered })).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn sync_data_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    // Ownership is checked before any store access so a rejected call leaves
    // no trace.
    if let Err(resp) = authorize_owner(&caller, &user_id) {
        return resp;
    }

    match state
        .service
        .sync_user(&user_id, SyncTrigger::Manual, Utc::now())
        .await
    {
        Ok(outcome) => Json(json!({
            "success": true,
            "message": "Data sync completed",
            "outcome": outcome,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn run_weekly_updates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.sweep(Utc::now()).await {
        Ok(summary) => Json(json!({ "success": true, "summary": summary })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn scheduler_health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.scheduler_health(Utc::now()).await {
        Ok(health) => Json(health).into_response(),
        Err(err) => store_error(err),
    }
}
