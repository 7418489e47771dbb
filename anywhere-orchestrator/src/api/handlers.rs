use std::sync::Arc;

use anywhere_common::{InstanceRecord, InstanceStatus, RegionInfo};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::AppState;
use crate::error::OrchestratorError;
use crate::store::StoreError;

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Error half of every handler result.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::InvalidRegion(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::ConcurrencyViolation(_) => StatusCode::CONFLICT,
            OrchestratorError::Persistence(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            OrchestratorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Instance record as returned to clients, with the region's display name.
#[derive(Serialize, ToSchema)]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    pub region_name: String,
}

impl InstanceView {
    fn new(state: &AppState, record: InstanceRecord) -> Self {
        let region_name = state.service.settings().region_name(&record.region);
        Self { record, region_name }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CreateInstanceRequest {
    pub region: String,
}

#[derive(Serialize, ToSchema)]
pub struct InstanceAccepted {
    pub uuid: Uuid,
    pub status: InstanceStatus,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up"))
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(
    get,
    path = "/api/v2ray/regions",
    responses((status = 200, description = "Configured regions", body = Vec<RegionInfo>))
)]
pub async fn list_regions(State(state): State<Arc<AppState>>) -> Json<Vec<RegionInfo>> {
    Json(state.service.list_regions())
}

#[utoipa::path(
    get,
    path = "/api/v2ray/instances",
    responses(
        (status = 200, description = "Live instances, newest first", body = Vec<InstanceView>),
        (status = 500, description = "Store failure", body = ErrorBody)
    )
)]
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InstanceView>>, ApiError> {
    let records = state.service.list_instances().await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| InstanceView::new(&state, r))
            .collect(),
    ))
}

/// Returns the region's active instance, creating one if there is none.
#[utoipa::path(
    post,
    path = "/api/v2ray/instances",
    request_body = CreateInstanceRequest,
    responses(
        (
            status = 202,
            description = "Instance admitted or already active",
            body = InstanceAccepted
        ),
        (status = 400, description = "Unknown region", body = ErrorBody),
        (status = 409, description = "Concurrent create detected", body = ErrorBody)
    )
)]
pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<InstanceAccepted>), ApiError> {
    let uuid = state.service.request_create(req.region.trim()).await?;
    // Admission already succeeded; a failed read-back only loses the status detail.
    let status = match state.service.get_instance(uuid).await {
        Ok(record) => record.status,
        Err(e) => {
            tracing::warn!(
                instance_uuid = %uuid,
                error = %e,
                "could not read back admitted instance, reporting pending"
            );
            InstanceStatus::Pending
        }
    };
    Ok((StatusCode::ACCEPTED, Json(InstanceAccepted { uuid, status })))
}

#[utoipa::path(
    get,
    path = "/api/v2ray/instances/{uuid}",
    params(("uuid" = Uuid, Path, description = "Instance uuid")),
    responses(
        (status = 200, description = "Instance", body = InstanceView),
        (status = 404, description = "Unknown or deleted", body = ErrorBody)
    )
)]
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<InstanceView>, ApiError> {
    let record = state.service.get_instance(uuid).await?;
    Ok(Json(InstanceView::new(&state, record)))
}

#[utoipa::path(
    delete,
    path = "/api/v2ray/instances/{uuid}",
    params(("uuid" = Uuid, Path, description = "Instance uuid")),
    responses(
        (status = 202, description = "Teardown started", body = InstanceAccepted),
        (status = 404, description = "Unknown or deleted", body = ErrorBody)
    )
)]
pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> Result<(StatusCode, Json<InstanceAccepted>), ApiError> {
    state.service.request_delete(uuid).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InstanceAccepted {
            uuid,
            status: InstanceStatus::Deleting,
        }),
    ))
}
