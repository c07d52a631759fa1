//! Census service integration: HTTP client and demographic-context joiner.

pub mod client;
pub mod joiner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::geography::{CountyCode, Vintage};

pub use client::CensusClient;
pub use joiner::DemographicJoiner;

/// Census failure modes. All of them are non-fatal to a job: the pipeline
/// records a warning and proceeds with empty demographic context.
#[derive(Error, Debug, Clone)]
pub enum CensusError {
    #[error("census api key not configured")]
    MissingKey,

    #[error("http transport: {0}")]
    Transport(String),

    #[error("rate limited after retries")]
    RateLimited,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("response parse: {0}")]
    Parse(String),
}

/// County-level race/ethnicity populations for one vintage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicsRow {
    pub county: CountyCode,
    pub total_population: i64,
    pub hispanic: i64,
    pub native_american: i64,
    pub asian: i64,
    pub black: i64,
    pub hawaiian_pacific_islander: i64,
    pub white: i64,
    pub other: i64,
    pub two_or_more: i64,
}

/// Tract-level income and minority distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TractRow {
    /// 11-character tract identifier (state + county + tract).
    pub tract_id: String,
    pub households: i64,
    pub median_income: Option<f64>,
    pub minority_percent: Option<f64>,
}

/// External demographic service operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CensusSource: Send + Sync {
    /// County-level race/ethnicity/population for the given vintage.
    async fn county_demographics(
        &self,
        counties: &[CountyCode],
        vintage: Vintage,
    ) -> Result<Vec<DemographicsRow>, CensusError>;

    /// Tract-level income and minority distributions for the counties.
    async fn tract_distributions(
        &self,
        counties: &[CountyCode],
        vintage: Vintage,
    ) -> Result<Vec<TractRow>, CensusError>;
}
