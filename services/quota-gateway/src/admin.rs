//! Admin API for credential management
//!
//! Served on a separate listener (`admin_listen_addr`) and never on the main
//! port. Responses never include usernames.
//!
//! Endpoints:
//! - GET    /admin/credentials  ids, status, failure counts
//! - POST   /admin/credentials  add `{id, username, limits?}`
//! - DELETE /admin/credentials/{id}  remove from the pool
//! - POST   /admin/credentials/{id}/reinstate  back to active
//! - GET    /admin/pool  pool snapshot

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use common::Secret;
use geonames_quota::{Ceilings, Credential, Pool};
use serde::Deserialize;
use tracing::info;

use crate::error::ApiError;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/{id}", delete(remove_credential))
        .route("/admin/credentials/{id}/reinstate", post(reinstate_credential))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_ok(body: serde_json::Value) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/credentials: every credential with status and failure count.
async fn list_credentials(State(state): State<AdminState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.pool.snapshot().await?;
    let credentials: Vec<_> = snapshot
        .credentials
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "status": c.status,
                "exhausted_for_secs": c.exhausted_for_secs,
                "consecutive_failures": c.consecutive_failures,
                "total_requests": c.usage.total_requests,
            })
        })
        .collect();
    Ok(json_ok(serde_json::json!({ "credentials": credentials })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddCredentialRequest {
    id: String,
    username: Secret<String>,
    #[serde(default)]
    limits: Option<Ceilings>,
}

/// POST /admin/credentials: add a credential at the end of the rotation.
async fn add_credential(
    State(state): State<AdminState>,
    body: Result<axum::Json<AddCredentialRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let axum::Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    if body.id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("id must not be empty".into()));
    }
    if body.username.is_empty() {
        return Err(ApiError::InvalidRequest("username must not be empty".into()));
    }

    let id = body.id.clone();
    state
        .pool
        .add_credential(
            Credential {
                id: body.id,
                username: body.username,
            },
            body.limits,
        )
        .await?;
    info!(credential_id = id, "credential added via admin API");

    Ok((
        StatusCode::CREATED,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "credential_id": id, "status": "active" }).to_string(),
    ))
}

/// DELETE /admin/credentials/{id}
async fn remove_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.pool.remove_credential(&id).await?;
    Ok(json_ok(
        serde_json::json!({ "credential_id": id, "status": "removed" }),
    ))
}

/// POST /admin/credentials/{id}/reinstate
async fn reinstate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.pool.reinstate(&id).await?;
    Ok(json_ok(
        serde_json::json!({ "credential_id": id, "status": "active" }),
    ))
}

/// GET /admin/pool: full pool snapshot.
async fn pool_status(State(state): State<AdminState>) -> Result<impl IntoResponse, ApiError> {
    Ok(axum::Json(state.pool.snapshot().await?))
}
