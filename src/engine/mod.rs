//! The analysis engine: aggregation pass and pipeline driver

pub mod aggregate;
pub mod pipeline;

use std::sync::Arc;

use crate::ai::AiClient;
use crate::census::CensusSource;
use crate::config::AppConfig;
use crate::jobs::store::ReportStore;
use crate::warehouse::Warehouse;

/// Process-wide collaborators handed to every pipeline run. Built once in
/// `main`; no module-level globals.
pub struct EngineContext {
    pub config: Arc<AppConfig>,
    pub warehouse: Arc<dyn Warehouse>,
    pub census: Arc<dyn CensusSource>,
    /// Absent when no narrative provider is configured; narratives degrade.
    pub ai: Option<Arc<AiClient>>,
    pub store: Arc<ReportStore>,
}
