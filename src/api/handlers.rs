//! HTTP request handlers

use super::auth::Caller;
use super::sse::turn_stream;
use super::types::{
    CancelResponse, CheckpointListResponse, CheckpointResponse, CreateTurnRequest,
    DeleteResponse, EditCheckpointRequest, EditCheckpointResponse, ErrorResponse, TurnEnvelope,
};
use super::AppState;
use crate::access::{Authorized, Identity, Resolution};
use crate::db::{validate_entries, DbError};
use crate::error::TurnError;
use crate::transport::{negotiate, AcceptPreference, TransportPlan};
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Turn submission
        .route("/v1/turns", post(create_turn))
        .route("/v1/conversations/:id/turns/:turn_id", get(get_turn))
        .route("/v1/conversations/:id/cancel", post(cancel_turn))
        // Checkpoints
        .route("/v1/conversations/:id/checkpoints", get(list_checkpoints))
        .route(
            "/v1/conversations/:id/checkpoints/:checkpoint_id",
            get(get_checkpoint),
        )
        .route(
            "/v1/conversations/:id/checkpoints/:checkpoint_id/edit",
            post(edit_checkpoint),
        )
        // Lifecycle
        .route("/v1/conversations/:id", axum::routing::delete(delete_conversation))
        .route("/health", get(health))
        .route("/version", get(get_version))
        .with_state(state)
}

/// JSON body whose rejections are reported as validation errors
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct ApiJson<T>(T);

async fn resolve_existing(
    state: &AppState,
    identity: &Identity,
    reference: &str,
) -> Result<Authorized, AppError> {
    Ok(state
        .gate
        .resolve(identity, Some(reference), Resolution::ExistingOnly)
        .await?)
}

// ============================================================
// Turns
// ============================================================

async fn create_turn(
    State(state): State<AppState>,
    Caller(identity): Caller,
    headers: HeaderMap,
    ApiJson(body): ApiJson<CreateTurnRequest>,
) -> Result<Response, AppError> {
    let accept = AcceptPreference::from_header(
        headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok()),
    );
    let plan = negotiate(body.stream, accept).map_err(TurnError::from)?;
    let (reference, request) = body.into_turn()?;

    let mode = if request.is_decision() {
        Resolution::ExistingOnly
    } else {
        Resolution::CreateIfMissing
    };
    let auth = state
        .gate
        .resolve(&identity, reference.as_deref(), mode)
        .await?;
    let handle = state.orchestrator.submit(&auth, request).await?;
    tracing::info!(
        conv_id = %handle.conversation_id,
        turn_id = %handle.turn_id,
        user_id = %identity.user_id,
        created = auth.created(),
        "Turn submitted"
    );

    match plan {
        TransportPlan::Envelope => {
            let turn = handle.finish().await?;
            Ok(Json(TurnEnvelope::from(&turn)).into_response())
        }
        TransportPlan::EventStream(delivery) => Ok(turn_stream(handle, delivery).into_response()),
    }
}

async fn get_turn(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, turn_id)): Path<(String, String)>,
) -> Result<Json<TurnEnvelope>, AppError> {
    let auth = resolve_existing(&state, &identity, &id).await?;
    let turn = state.orchestrator.turn(&auth, &turn_id).await?;
    Ok(Json(TurnEnvelope::from(&turn)))
}

async fn cancel_turn(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let auth = resolve_existing(&state, &identity, &id).await?;
    let cancelled = state.orchestrator.cancel(&auth);
    Ok(Json(CancelResponse { cancelled }))
}

// ============================================================
// Checkpoints
// ============================================================

async fn list_checkpoints(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<CheckpointListResponse>, AppError> {
    let auth = resolve_existing(&state, &identity, &id).await?;
    let data = state.store.list(auth.conversation_id()).await?;
    Ok(Json(CheckpointListResponse {
        object: "list",
        data,
    }))
}

async fn get_checkpoint(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, checkpoint_id)): Path<(String, String)>,
) -> Result<Json<CheckpointResponse>, AppError> {
    let auth = resolve_existing(&state, &identity, &id).await?;
    let checkpoint = state
        .store
        .resume_from(auth.conversation_id(), &checkpoint_id)
        .await?;
    Ok(Json(checkpoint.into()))
}

async fn edit_checkpoint(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path((id, checkpoint_id)): Path<(String, String)>,
    ApiJson(body): ApiJson<EditCheckpointRequest>,
) -> Result<Json<EditCheckpointResponse>, AppError> {
    if body.entries.is_empty() {
        return Err(TurnError::validation("replacement entries must not be empty").into());
    }
    validate_entries(&body.entries).map_err(TurnError::Validation)?;

    let auth = resolve_existing(&state, &identity, &id).await?;
    let checkpoint_id = state
        .store
        .edit(auth.conversation_id(), &checkpoint_id, &body.entries)
        .await?;
    tracing::info!(
        conv_id = %auth.conversation_id(),
        checkpoint_id = %checkpoint_id,
        "Checkpoint edited"
    );
    Ok(Json(EditCheckpointResponse { checkpoint_id }))
}

// ============================================================
// Lifecycle
// ============================================================

async fn delete_conversation(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let auth = resolve_existing(&state, &identity, &id).await?;
    state.orchestrator.delete(&auth).await?;
    Ok(Json(DeleteResponse {
        id: auth.conversation_id().to_string(),
        deleted: true,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_version() -> &'static str {
    concat!("agentgate ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

pub struct AppError(pub TurnError);

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        AppError(err)
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        AppError(err.into())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError(TurnError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TurnError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TurnError::Unauthenticated => StatusCode::UNAUTHORIZED,
            TurnError::AccessDenied(_) => StatusCode::FORBIDDEN,
            TurnError::NotFound(_) => StatusCode::NOT_FOUND,
            TurnError::IncompatibleTransport(_) => StatusCode::NOT_ACCEPTABLE,
            TurnError::Conflict(_) => StatusCode::CONFLICT,
            TurnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = Json(ErrorResponse::new(self.0.kind(), self.0.to_string()));
        if status == StatusCode::UNAUTHORIZED {
            return (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response();
        }
        (status, body).into_response()
    }
}
