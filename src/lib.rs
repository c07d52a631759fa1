//! JustData analytics engine
//!
//! The shared core behind the JustData applications: job orchestration,
//! the warehouse-to-report analysis pipeline, live progress streaming,
//! narrative generation and report storage, exposed over a uniform REST
//! surface.

use std::sync::Arc;

pub mod ai;
pub mod api;
pub mod census;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod models;
pub mod narrative;
pub mod query;
pub mod recipes;
pub mod warehouse;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: jobs::Orchestrator,
    pub store: Arc<jobs::ReportStore>,
    /// Set at startup once warehouse credentials resolved.
    pub warehouse_ready: bool,
}
