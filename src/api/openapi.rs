//! OpenAPI documentation

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{analyze, health, progress, report};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "JustData API",
        version = "1.0.0",
        description = "Shared analytics engine for lending and branch analysis applications",
        license(name = "AGPL-3.0", url = "https://www.gnu.org/licenses/agpl-3.0.html")
    ),
    servers(
        (url = "/", description = "Engine root")
    ),
    paths(
        // Health
        health::health_check,
        // Jobs
        analyze::analyze,
        progress::progress,
        report::status,
        report::cancel,
        // Reports
        report::report_data,
        report::download,
    ),
    components(
        schemas(
            // Requests
            crate::models::request::AnalysisRequest,
            crate::models::request::FilterSet,
            crate::models::request::DataDomain,
            crate::models::request::RecipeKind,
            crate::models::request::LoanPurpose,
            crate::models::request::ActionTaken,
            crate::models::request::Occupancy,
            crate::models::request::UnitsBand,
            crate::models::request::ConstructionMethod,
            crate::models::request::PeerVolumeBand,
            crate::models::geography::CountyCode,
            crate::models::geography::Vintage,
            // Jobs
            analyze::AnalyzeResponse,
            report::CancelResponse,
            crate::models::progress::JobState,
            crate::models::progress::JobStatus,
            crate::models::progress::ProgressEvent,
            // Report
            crate::models::report::Report,
            crate::models::report::ReportMetadata,
            crate::models::report::SummaryRow,
            crate::models::report::DemographicRow,
            crate::models::report::IncomeNeighborhoodTable,
            crate::models::report::IncomeBucketRow,
            crate::models::report::IncomeMissingRow,
            crate::models::report::QuartileRow,
            crate::models::report::LenderTable,
            crate::models::report::LenderRow,
            crate::models::report::LenderYearRow,
            crate::models::report::ConcentrationRow,
            crate::models::report::ConcentrationBasis,
            crate::models::report::ConcentrationCategory,
            crate::models::report::TrendRow,
            crate::models::report::TrendDirection,
            crate::models::report::ShareDenominator,
            crate::models::report::CountAmount,
            crate::models::report::ShareCell,
            crate::models::report::VintageDemographics,
            crate::models::report::DemographicContext,
            crate::models::report::PeerComparison,
            crate::models::report::PeerMeans,
            crate::models::classification::RaceEthnicity,
            crate::models::classification::IncomeLevel,
            crate::models::classification::MinorityQuartile,
            crate::models::classification::QuartileBoundaries,
            crate::recipes::DownloadFormat,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "jobs", description = "Job submission, progress and status"),
        (name = "reports", description = "Report retrieval and downloads")
    )
)]
pub struct ApiDoc;

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
