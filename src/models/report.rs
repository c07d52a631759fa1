//! The report model: every tabular artifact the pipeline produces.
//!
//! A `Report` only comes into existence when all pipeline stages for its job
//! completed without fatal error, and is immutable once stored. Amounts in
//! report tables are dollars (the engine carries warehouse-native thousands
//! internally and converts when rows are built).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::classification::{
    IncomeLevel, MinorityQuartile, QuartileBoundaries, RaceEthnicity,
};
use crate::models::geography::{CountyCode, Vintage};
use crate::models::request::{DataDomain, FilterSet, PeerVolumeBand, RecipeKind};

/// A count plus a dollar amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CountAmount {
    pub count: i64,
    pub amount: f64,
}

/// Reference value against which percent shares are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ShareDenominator {
    /// Total originations for the year (engine default).
    TotalForYear,
    /// Sum of row counts within the classification group.
    ClassificationGroup,
    /// Sum of the three loan-size categories (small-business recipes).
    LoanSizeCategories,
}

/// Whether market shares for concentration use amounts or counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ConcentrationBasis {
    Amounts,
    Counts,
}

/// HHI concentration category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ConcentrationCategory {
    Unconcentrated,
    Moderate,
    High,
}

impl ConcentrationCategory {
    /// <1500 unconcentrated, 1500..=2500 moderate, >2500 high.
    pub fn from_hhi(hhi: f64) -> Self {
        if hhi < 1500.0 {
            ConcentrationCategory::Unconcentrated
        } else if hhi <= 2500.0 {
            ConcentrationCategory::Moderate
        } else {
            ConcentrationCategory::High
        }
    }
}

/// Year-over-year movement indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl TrendDirection {
    /// Flat band: |Δ| < 0.05 percentage points.
    pub fn from_pct_change(pct_change: f64) -> Self {
        if pct_change.abs() < 0.05 {
            TrendDirection::Flat
        } else if pct_change > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        }
    }
}

/// Request echo, provenance and warnings for a finished report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub job_id: Uuid,
    pub data_domain: DataDomain,
    pub recipe: RecipeKind,
    /// Canonicalized filter set the job ran with.
    pub filter_set: FilterSet,
    /// Census vintages the demographic context was fetched for.
    pub census_vintages: Vec<Vintage>,
    /// SHA-256 over the warehouse query text and parameters.
    pub query_hash: String,
    pub denominator: ShareDenominator,
    pub concentration_basis: ConcentrationBasis,
    pub created_at: DateTime<Utc>,
    /// Non-fatal degradations recorded during the run.
    pub warnings: Vec<String>,
}

/// One `(county, year)` row of the summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    pub county: CountyCode,
    pub year: i32,
    pub total: CountAmount,
    /// Per combined-race/ethnicity counts and amounts.
    pub demographics: BTreeMap<RaceEthnicity, CountAmount>,
    pub lmi_tract: CountAmount,
    pub lmi_borrower: CountAmount,
    pub mmct: CountAmount,
}

/// One `(year, race/ethnicity)` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DemographicRow {
    pub year: i32,
    pub group: RaceEthnicity,
    pub count: i64,
    pub amount: f64,
    /// Percent share against the recipe denominator.
    pub share_of_total: Option<f64>,
    /// Percent share of population, joined from census context.
    pub share_of_population: Option<f64>,
}

/// One `(year, income level)` row, for borrower- or tract-income tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncomeBucketRow {
    pub year: i32,
    pub level: IncomeLevel,
    pub count: i64,
    pub amount: f64,
    pub lending_share: Option<f64>,
    /// Census-derived share of the same band, when context is available.
    pub census_share: Option<f64>,
}

/// One `(year, minority quartile)` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuartileRow {
    pub year: i32,
    pub quartile: MinorityQuartile,
    pub count: i64,
    pub amount: f64,
    pub lending_share: Option<f64>,
    pub census_share: Option<f64>,
}

/// Per-year counts of rows excluded from income bucketing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncomeMissingRow {
    pub year: i32,
    /// Loans with missing applicant income or missing/zero MSA median.
    pub missing_borrower_income: i64,
    /// Loans in tracts with missing tract-to-MSA income ratio.
    pub missing_tract_income: i64,
}

/// Income and neighborhood lending table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncomeNeighborhoodTable {
    pub borrower: Vec<IncomeBucketRow>,
    pub tract: Vec<IncomeBucketRow>,
    pub minority_quartiles: Vec<QuartileRow>,
    /// Boundaries the quartile rows were classified with, for range display.
    pub quartile_boundaries: Option<QuartileBoundaries>,
    pub missing: Vec<IncomeMissingRow>,
}

/// One lender's aggregate row across the requested years.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LenderRow {
    pub lender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lender_name: Option<String>,
    /// Total count in the most recent requested year; the ranking key.
    pub latest_year_count: i64,
    pub total: CountAmount,
    pub demographics: BTreeMap<RaceEthnicity, CountAmount>,
    pub lmi_tract: CountAmount,
    pub lmi_borrower: CountAmount,
    pub mmct: CountAmount,
}

/// Lender ranking table, truncated to the recipe's top N.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LenderTable {
    pub lenders: Vec<LenderRow>,
    /// True when more lenders exist than shown; the frontend may request
    /// the full expansion.
    pub truncated: bool,
    pub total_lenders: usize,
}

/// Per-year panel row for a top-N lender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LenderYearRow {
    pub lender_id: String,
    pub year: i32,
    pub count: i64,
    pub amount: f64,
}

/// Per-year Herfindahl–Hirschman concentration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConcentrationRow {
    pub year: i32,
    /// Σ(shareᵢ%)², 0..10000; null for an empty year.
    pub hhi: Option<f64>,
    pub category: Option<ConcentrationCategory>,
}

/// Per-year totals and year-over-year deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrendRow {
    pub year: i32,
    pub count: i64,
    pub amount: f64,
    pub count_delta: Option<i64>,
    pub count_pct_change: Option<f64>,
    pub amount_delta: Option<f64>,
    pub amount_pct_change: Option<f64>,
    pub direction: Option<TrendDirection>,
}

/// Population plus percent share for one race/ethnicity group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ShareCell {
    pub population: i64,
    pub share: f64,
}

/// County-level demographics for one vintage, combined across the report's
/// geography (population-weighted percents, summed counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VintageDemographics {
    pub vintage: Vintage,
    pub total_population: i64,
    pub hispanic: ShareCell,
    pub native_american: ShareCell,
    pub asian: ShareCell,
    pub black: ShareCell,
    pub hawaiian_pacific_islander: ShareCell,
    pub white: ShareCell,
    pub other: ShareCell,
    pub two_or_more: ShareCell,
}

/// Demographic context table; empty (with a warning in metadata) when the
/// census service was unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DemographicContext {
    pub vintages: Vec<VintageDemographics>,
}

impl DemographicContext {
    pub fn is_empty(&self) -> bool {
        self.vintages.is_empty()
    }
}

/// Mean metrics over the peer set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerMeans {
    pub count: f64,
    pub amount: f64,
    pub lmi_borrower_share: Option<f64>,
    pub lmi_tract_share: Option<f64>,
    pub mmct_share: Option<f64>,
}

/// Subject lender metrics side-by-side with the mean of peers in the
/// volume band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerComparison {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<LenderRow>,
    pub band: PeerVolumeBand,
    pub peer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_mean: Option<PeerMeans>,
}

/// The finalized analysis report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: Vec<SummaryRow>,
    pub by_demographic: Vec<DemographicRow>,
    pub by_income_neighborhood: IncomeNeighborhoodTable,
    pub by_lender: LenderTable,
    pub by_lender_by_year: Vec<LenderYearRow>,
    pub concentration: Vec<ConcentrationRow>,
    pub trends: Vec<TrendRow>,
    pub demographic_context: DemographicContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_comparison: Option<PeerComparison>,
    /// Section name → prose. Missing sections are permitted.
    pub narratives: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geography::CountyCode;

    fn sample_report() -> Report {
        let filters = FilterSet {
            data_domain: DataDomain::Mortgage,
            geography: vec![CountyCode::parse("05143").unwrap()],
            years: vec![2022],
            loan_purposes: vec![],
            actions_taken: vec![],
            occupancy: vec![],
            units: vec![],
            construction_method: vec![],
            exclude_reverse_mortgage: true,
            subject_lender_id: None,
            peer_volume_band: None,
        };
        let mut demographics = BTreeMap::new();
        demographics.insert(RaceEthnicity::White, CountAmount { count: 600, amount: 9.0e7 });
        demographics.insert(RaceEthnicity::NoData, CountAmount { count: 90, amount: 1.2e7 });
        Report {
            metadata: ReportMetadata {
                job_id: Uuid::nil(),
                data_domain: DataDomain::Mortgage,
                recipe: RecipeKind::Mortgage,
                filter_set: filters,
                census_vintages: vec![Vintage::Decennial2020],
                query_hash: "abc123".into(),
                denominator: ShareDenominator::TotalForYear,
                concentration_basis: ConcentrationBasis::Amounts,
                created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                warnings: vec![],
            },
            summary: vec![SummaryRow {
                county: CountyCode::parse("05143").unwrap(),
                year: 2022,
                total: CountAmount { count: 1000, amount: 1.5e8 },
                demographics,
                lmi_tract: CountAmount { count: 400, amount: 5.0e7 },
                lmi_borrower: CountAmount { count: 200, amount: 2.4e7 },
                mmct: CountAmount { count: 120, amount: 1.6e7 },
            }],
            by_demographic: vec![],
            by_income_neighborhood: IncomeNeighborhoodTable::default(),
            by_lender: LenderTable::default(),
            by_lender_by_year: vec![],
            concentration: vec![ConcentrationRow {
                year: 2022,
                hhi: Some(3800.0),
                category: Some(ConcentrationCategory::High),
            }],
            trends: vec![],
            demographic_context: DemographicContext::default(),
            peer_comparison: None,
            narratives: BTreeMap::new(),
        }
    }

    #[test]
    fn report_round_trips_through_json() {
        let report = sample_report();
        let json = serde_json::to_string(&report).unwrap();
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }

    #[test]
    fn concentration_categories() {
        assert_eq!(
            ConcentrationCategory::from_hhi(1499.9),
            ConcentrationCategory::Unconcentrated
        );
        assert_eq!(ConcentrationCategory::from_hhi(1500.0), ConcentrationCategory::Moderate);
        assert_eq!(ConcentrationCategory::from_hhi(2500.0), ConcentrationCategory::Moderate);
        assert_eq!(ConcentrationCategory::from_hhi(2500.1), ConcentrationCategory::High);
        assert_eq!(ConcentrationCategory::from_hhi(3800.0), ConcentrationCategory::High);
    }

    #[test]
    fn trend_direction_flat_band() {
        assert_eq!(TrendDirection::from_pct_change(0.04), TrendDirection::Flat);
        assert_eq!(TrendDirection::from_pct_change(-0.04), TrendDirection::Flat);
        assert_eq!(TrendDirection::from_pct_change(0.05), TrendDirection::Up);
        assert_eq!(TrendDirection::from_pct_change(-1.2), TrendDirection::Down);
    }

    #[test]
    fn report_json_uses_camel_case_table_names() {
        let report = sample_report();
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("byDemographic").is_some());
        assert!(value.get("byIncomeNeighborhood").is_some());
        assert!(value.get("byLenderByYear").is_some());
        assert!(value.get("demographicContext").is_some());
    }
}
