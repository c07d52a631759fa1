//! Typed domain models shared by the engine and the API layer

pub mod classification;
pub mod geography;
pub mod progress;
pub mod report;
pub mod request;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use classification::{IncomeLevel, MinorityQuartile, QuartileBoundaries, RaceEthnicity};
pub use geography::{CountyCode, Vintage};
pub use progress::{JobState, JobStatus, ProgressEvent};
pub use report::Report;
pub use request::{AnalysisRequest, DataDomain, FilterSet, RecipeKind};

/// One warehouse row after projection decode, shared across data domains.
///
/// Mortgage rows populate every field; branch and small-business rows leave
/// the mortgage-only derivations as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRow {
    pub year: i32,
    pub lender_id: String,
    pub lender_name: Option<String>,
    pub county: CountyCode,
    pub tract_id: Option<String>,
    /// Loan amount in warehouse-native thousands of dollars.
    pub amount: Option<f64>,
    pub race_ethnicity: RaceEthnicity,
    pub borrower_income_level: Option<IncomeLevel>,
    pub tract_income_level: Option<IncomeLevel>,
    pub is_mmct: Option<bool>,
    pub tract_minority_percent: Option<f64>,
    /// Key under which duplicate warehouse rows are counted once.
    pub dedup_key: String,
}

impl LoanRow {
    /// Minimal row with the given identity, everything else unset. Used by
    /// tests and synthetic fixtures.
    pub fn new(year: i32, lender_id: &str, county: CountyCode, dedup_key: &str) -> Self {
        Self {
            year,
            lender_id: lender_id.to_string(),
            lender_name: None,
            county,
            tract_id: None,
            amount: None,
            race_ethnicity: RaceEthnicity::NoData,
            borrower_income_level: None,
            tract_income_level: None,
            is_mmct: None,
            tract_minority_percent: None,
            dedup_key: dedup_key.to_string(),
        }
    }
}
