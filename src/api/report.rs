//! Report data, status and download endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::progress::JobStatus;
use crate::models::report::Report;
use crate::recipes::{DownloadFormat, RecipeSpec};

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReportDataQuery {
    /// Job identifier
    pub job_id: Uuid,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DownloadQuery {
    /// Job identifier
    pub job_id: Uuid,
    /// Download format (excel, pdf, csv, json, zip, pptx)
    pub format: String,
}

/// Get job status
#[utoipa::path(
    get,
    path = "/status/{job_id}",
    tag = "jobs",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Job status", body = JobStatus),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse)
    )
)]
pub async fn status(
    State(state): State<crate::AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobStatus>> {
    Ok(Json(state.orchestrator.get(job_id)?))
}

/// Cancel a running job
///
/// Returns `cancelled: false` when the job is already terminal; terminal
/// states are sticky.
#[utoipa::path(
    post,
    path = "/cancel/{job_id}",
    tag = "jobs",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelResponse),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse)
    )
)]
pub async fn cancel(
    State(state): State<crate::AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<CancelResponse>> {
    let cancelled = state.orchestrator.cancel(job_id)?;
    Ok(Json(CancelResponse { job_id, cancelled }))
}

#[derive(serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

/// Get the report JSON for a finished job
#[utoipa::path(
    get,
    path = "/report-data",
    tag = "reports",
    params(ReportDataQuery),
    responses(
        (status = 200, description = "Report JSON", body = Report),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
        (status = 410, description = "Report expired", body = crate::error::ErrorResponse)
    )
)]
pub async fn report_data(
    State(state): State<crate::AppState>,
    Query(query): Query<ReportDataQuery>,
) -> AppResult<Json<Report>> {
    let report = state.store.get(query.job_id).await?;
    Ok(Json((*report).clone()))
}

/// Download the report in a file format
#[utoipa::path(
    get,
    path = "/download",
    tag = "reports",
    params(DownloadQuery),
    responses(
        (status = 200, description = "File download"),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
        (status = 409, description = "Job not yet terminal", body = crate::error::ErrorResponse),
        (status = 410, description = "Report expired", body = crate::error::ErrorResponse),
        (status = 415, description = "Format unsupported by recipe", body = crate::error::ErrorResponse)
    )
)]
pub async fn download(
    State(state): State<crate::AppState>,
    Query(query): Query<DownloadQuery>,
) -> AppResult<impl IntoResponse> {
    let format = DownloadFormat::parse(&query.format)
        .ok_or_else(|| AppError::UnsupportedFormat(query.format.clone()))?;

    // A download requested before completion is a conflict, not a miss.
    if let Ok(status) = state.orchestrator.get(query.job_id) {
        if !status.state.is_terminal() {
            return Err(AppError::JobNotTerminal(query.job_id.to_string()));
        }
    }

    let report = state.store.get(query.job_id).await?;
    let recipe = RecipeSpec::for_kind(report.metadata.recipe);
    let download = state.store.download(query.job_id, format, &recipe).await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(download.mime));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", download.filename))
            .map_err(|e| AppError::Internal(e.to_string()))?,
    );
    Ok((headers, download.bytes))
}
