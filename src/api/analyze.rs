//! Analysis submission endpoint

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::request::AnalysisRequest;

/// Links to the job's control endpoints.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub job_id: Uuid,
    pub status_url: String,
    pub progress_url: String,
    pub report_url: String,
    pub download_url: String,
}

/// Submit an analysis request
#[utoipa::path(
    post,
    path = "/analyze",
    tag = "jobs",
    request_body = AnalysisRequest,
    responses(
        (status = 202, description = "Job accepted", body = AnalyzeResponse),
        (status = 400, description = "Validation failure", body = crate::error::ErrorResponse)
    )
)]
pub async fn analyze(
    State(state): State<crate::AppState>,
    Json(request): Json<AnalysisRequest>,
) -> AppResult<(StatusCode, Json<AnalyzeResponse>)> {
    let job_id = state.orchestrator.submit(request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AnalyzeResponse {
            job_id,
            status_url: format!("/status/{job_id}"),
            progress_url: format!("/progress/{job_id}"),
            report_url: format!("/report-data?job_id={job_id}"),
            download_url: format!("/download?job_id={job_id}&format=json"),
        }),
    ))
}
