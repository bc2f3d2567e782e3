//! HTTP handlers.
//!
//! Implements:
//! - GET /health
//! - POST /webhooks/notifications - intake of repository push notifications
//! - POST /sync/{feed} - run one change-feed pass now
//! - POST /publication/drain - export documents whose publication date has passed
//! - POST /subscriptions/ensure - create missing webhook subscriptions
//! - POST /documents/{site_id}/{list_id}/{file_name} - upload and register a document
//! - GET|DELETE /documents/{object_id}

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use docbroker_core::{
    BrokerError, FeedType, NotificationBatch, ObjectIdentifiers, WebhookSubscriptionState,
};
use docbroker_sync::{DrainReport, IntakeOutcome, SyncReport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ApiError, Result};
use crate::services::Services;

/// Header carrying the repository fields of an uploaded document as a JSON object.
pub const DOCUMENT_FIELDS_HEADER: &str = "x-document-fields";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub containers: usize,
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        containers: state.services.ctx.settings.containers.len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(alias = "validationToken")]
    validationtoken: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedResponse {
    pub message_id: String,
    pub notifications: usize,
}

/// POST /webhooks/notifications
///
/// A subscription handshake is answered by echoing the validation token as plain text within the
/// repository's deadline; anything else is queued and acknowledged with 202.
pub async fn notifications_handler(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    body: Bytes,
) -> Result<Response> {
    let batch = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<NotificationBatch>(&body)?)
    };

    let outcome = state
        .services
        .pipeline
        .intake(query.validationtoken.as_deref(), batch)
        .await?;

    Ok(match outcome {
        IntakeOutcome::Validation(token) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token,
        )
            .into_response(),
        IntakeOutcome::Queued {
            message_id,
            notifications,
        } => (
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                message_id,
                notifications,
            }),
        )
            .into_response(),
    })
}

/// POST /sync/{feed}
pub async fn sync_handler(
    State(state): State<AppState>,
    Path(feed): Path<String>,
) -> Result<Json<SyncReport>> {
    let feed: FeedType = feed.parse()?;
    let report = state.services.engine.run(feed).await?;
    Ok(Json(report))
}

/// POST /publication/drain
pub async fn drain_handler(State(state): State<AppState>) -> Result<Json<DrainReport>> {
    let report = state.services.ctx.publications.drain().await?;
    Ok(Json(report))
}

/// POST /subscriptions/ensure
pub async fn ensure_subscriptions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<WebhookSubscriptionState>>> {
    let subscriptions = state.services.pipeline.ensure_all_subscriptions().await?;
    Ok(Json(subscriptions))
}

fn document_fields(headers: &HeaderMap) -> Result<Map<String, Value>> {
    let Some(raw) = headers.get(DOCUMENT_FIELDS_HEADER) else {
        return Ok(Map::new());
    };
    let raw = raw
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{} is not valid text", DOCUMENT_FIELDS_HEADER)))?;
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(ApiError::BadRequest(format!(
            "{} must be a JSON object",
            DOCUMENT_FIELDS_HEADER
        ))),
    }
}

/// POST /documents/{site_id}/{list_id}/{file_name}
pub async fn register_document_handler(
    State(state): State<AppState>,
    Path((site_id, list_id, file_name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ObjectIdentifiers>)> {
    let fields = document_fields(&headers)?;
    debug!(
        "Registering {} ({} bytes, {} field(s))",
        file_name,
        body.len(),
        fields.len()
    );
    let record = state
        .services
        .registrar
        .register(&site_id, &list_id, &file_name, &body, &fields)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /documents/{object_id}
pub async fn get_document_handler(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> Result<Json<ObjectIdentifiers>> {
    let record = state
        .services
        .ctx
        .identities
        .get_by_object_id(&object_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("object {}", object_id)))?;
    Ok(Json(record))
}

/// DELETE /documents/{object_id}
pub async fn delete_document_handler(
    State(state): State<AppState>,
    Path(object_id): Path<String>,
) -> Result<StatusCode> {
    state.services.registrar.delete(&object_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
