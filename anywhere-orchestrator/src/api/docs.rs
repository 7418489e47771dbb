use anywhere_common::{InstanceRecord, InstanceStatus, RegionInfo};
use axum::Json;
use utoipa::OpenApi;

use super::handlers;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_regions,
        handlers::list_instances,
        handlers::create_instance,
        handlers::get_instance,
        handlers::delete_instance
    ),
    components(
        schemas(
            InstanceRecord,
            InstanceStatus,
            RegionInfo,
            handlers::InstanceView,
            handlers::CreateInstanceRequest,
            handlers::InstanceAccepted,
            handlers::ErrorBody
        )
    ),
    tags(
        (name = "anywhere", description = "Per-region proxy instance lifecycle")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
