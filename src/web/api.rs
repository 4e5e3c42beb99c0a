//! JSON endpoints for the dashboard.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::policy::{NewAction, PolicyKind};
use crate::store::{PolicyStore, normalize_address};

/// Default page size for `/api/log`.
pub const DEFAULT_LOG_LIMIT: usize = 50;
/// Upper bound on `/api/log` page size.
pub const MAX_LOG_LIMIT: usize = 500;

const MANUAL_ADD_DETAIL: &str = "Added manually via dashboard";
const MANUAL_REMOVE_DETAIL: &str = "Removed manually via dashboard";

type ApiResponse = (StatusCode, Json<Value>);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PolicyStore>,
}

/// Build the Axum router with the dashboard REST routes.
pub fn dashboard_routes(store: Arc<dyn PolicyStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/policies/{kind}", get(list_policies).post(add_policy))
        .route("/api/policies/{kind}/{email}", delete(remove_policy))
        .route("/api/log", get(list_log))
        .route("/api/log/{id}", get(get_log_entry))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.into()})),
    )
}

fn not_found(message: &str) -> ApiResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": message})))
}

fn internal_error(context: &str, e: DatabaseError) -> ApiResponse {
    error!(error = %e, "{context} failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{context} failed")})),
    )
}

fn parse_kind(raw: &str) -> Result<PolicyKind, ApiResponse> {
    raw.parse().map_err(bad_request)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "postal-inspector"
    }))
}

// ── Stats ───────────────────────────────────────────────────────────────

async fn stats(State(state): State<AppState>) -> ApiResponse {
    match state.store.stats().await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))),
        Err(e) => internal_error("Loading stats", e),
    }
}

// ── Policies ────────────────────────────────────────────────────────────

async fn list_policies(State(state): State<AppState>, Path(kind): Path<String>) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };

    match state.store.list_policies(kind).await {
        Ok(policies) => (StatusCode::OK, Json(json!(policies))),
        Err(e) => internal_error("Listing policies", e),
    }
}

#[derive(Deserialize)]
struct AddPolicyRequest {
    email: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn add_policy(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<AddPolicyRequest>,
) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let email = normalize_address(&body.email);
    if email.is_empty() {
        return bad_request("Email is required");
    }
    let reason = body
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| MANUAL_ADD_DETAIL.to_string());

    let created = match state.store.add_policy(&email, kind, &reason).await {
        Ok(created) => created,
        Err(e) => return internal_error("Adding policy", e),
    };

    if !created {
        return (
            StatusCode::OK,
            Json(json!({"status": "exists", "email": email, "kind": kind})),
        );
    }

    info!(sender = %email, kind = %kind, "Policy added via dashboard");
    let action = NewAction::new(kind.added_action(), &email, "", "", MANUAL_ADD_DETAIL);
    if let Err(e) = state.store.log_action(action).await {
        warn!(error = %e, "Failed to log dashboard policy add");
    }
    (
        StatusCode::CREATED,
        Json(json!({"status": "added", "email": email, "kind": kind})),
    )
}

async fn remove_policy(
    State(state): State<AppState>,
    Path((kind, email)): Path<(String, String)>,
) -> ApiResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let email = normalize_address(&email);

    match state.store.remove_policy(kind, &email).await {
        Ok(true) => {
            info!(sender = %email, kind = %kind, "Policy removed via dashboard");
            let action = NewAction::new(kind.removed_action(), &email, "", "", MANUAL_REMOVE_DETAIL);
            if let Err(e) = state.store.log_action(action).await {
                warn!(error = %e, "Failed to log dashboard policy removal");
            }
            (
                StatusCode::OK,
                Json(json!({"status": "removed", "email": email, "kind": kind})),
            )
        }
        Ok(false) => not_found("Policy not found"),
        Err(e) => internal_error("Removing policy", e),
    }
}

// ── Action log ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LogQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_log(State(state): State<AppState>, Query(query): Query<LogQuery>) -> ApiResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let entries = match state.store.list_actions(limit, offset).await {
        Ok(entries) => entries,
        Err(e) => return internal_error("Listing action log", e),
    };
    let total = match state.store.action_count().await {
        Ok(total) => total,
        Err(e) => return internal_error("Counting action log", e),
    };

    (
        StatusCode::OK,
        Json(json!({
            "entries": entries,
            "total": total,
            "limit": limit,
            "offset": offset,
        })),
    )
}

async fn get_log_entry(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let entry = match state.store.get_action(&id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found("Log entry not found"),
        Err(e) => return internal_error("Loading log entry", e),
    };

    let snapshot = match &entry.snapshot_ref {
        Some(snapshot_id) => match state.store.get_snapshot(snapshot_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(snapshot_id = %snapshot_id, error = %e, "Failed to load snapshot");
                None
            }
        },
        None => None,
    };

    (
        StatusCode::OK,
        Json(json!({"entry": entry, "snapshot": snapshot})),
    )
}
