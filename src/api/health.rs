//! Health check endpoint

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// True once warehouse credentials are resolvable
    pub ok: bool,
    /// Version of the service
    pub version: String,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Warehouse credentials unresolvable", body = crate::error::ErrorResponse)
    )
)]
pub async fn health_check(
    State(state): State<crate::AppState>,
) -> AppResult<Json<HealthResponse>> {
    if !state.warehouse_ready {
        return Err(AppError::WarehouseUnavailable(
            "warehouse credentials not resolvable".to_string(),
        ));
    }
    Ok(Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
