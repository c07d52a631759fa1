//! Analysis request types: the universal `FilterSet` and per-application
//! request envelope.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};
use crate::models::geography::CountyCode;

/// Data domain a request runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum DataDomain {
    Mortgage,
    SmallBusiness,
    Branch,
}

impl DataDomain {
    /// Supported vintage range of the warehouse snapshot for this domain.
    pub fn supported_years(&self) -> std::ops::RangeInclusive<i32> {
        match self {
            DataDomain::Mortgage => 2018..=2023,
            DataDomain::SmallBusiness => 2018..=2023,
            DataDomain::Branch => 2017..=2024,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DataDomain::Mortgage => "mortgage",
            DataDomain::SmallBusiness => "smallBusiness",
            DataDomain::Branch => "branch",
        }
    }
}

impl std::fmt::Display for DataDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Loan purpose filter (mortgage only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LoanPurpose {
    HomePurchase,
    Refinance,
    CashOutRefinance,
    HomeEquity,
    HomeImprovement,
    OtherPurpose,
}

impl LoanPurpose {
    /// Warehouse code (HMDA loan_purpose).
    pub fn code(&self) -> i16 {
        match self {
            LoanPurpose::HomePurchase => 1,
            LoanPurpose::HomeImprovement => 2,
            LoanPurpose::Refinance => 31,
            LoanPurpose::CashOutRefinance => 32,
            LoanPurpose::HomeEquity => 4,
            LoanPurpose::OtherPurpose => 5,
        }
    }
}

/// Action-taken filter (mortgage only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ActionTaken {
    Originated,
    ApprovedNotAccepted,
    Denied,
    Withdrawn,
    Incomplete,
    Purchased,
}

impl ActionTaken {
    pub fn code(&self) -> i16 {
        match self {
            ActionTaken::Originated => 1,
            ActionTaken::ApprovedNotAccepted => 2,
            ActionTaken::Denied => 3,
            ActionTaken::Withdrawn => 4,
            ActionTaken::Incomplete => 5,
            ActionTaken::Purchased => 6,
        }
    }
}

/// Occupancy filter (mortgage only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Occupancy {
    Owner,
    Second,
    Investor,
}

impl Occupancy {
    pub fn code(&self) -> i16 {
        match self {
            Occupancy::Owner => 1,
            Occupancy::Second => 2,
            Occupancy::Investor => 3,
        }
    }
}

/// Dwelling units band (mortgage only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum UnitsBand {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5+")]
    FivePlus,
}

impl UnitsBand {
    /// Warehouse predicate fragment; 1..4 are exact counts, 5+ is a floor.
    pub fn bounds(&self) -> (i16, Option<i16>) {
        match self {
            UnitsBand::One => (1, Some(1)),
            UnitsBand::Two => (2, Some(2)),
            UnitsBand::Three => (3, Some(3)),
            UnitsBand::Four => (4, Some(4)),
            UnitsBand::FivePlus => (5, None),
        }
    }
}

/// Construction method filter (mortgage only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ConstructionMethod {
    SiteBuilt,
    Manufactured,
}

impl ConstructionMethod {
    pub fn code(&self) -> i16 {
        match self {
            ConstructionMethod::SiteBuilt => 1,
            ConstructionMethod::Manufactured => 2,
        }
    }
}

/// Multiplicative window around the subject lender's volume defining the
/// peer set for peer-comparison recipes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerVolumeBand {
    pub low_multiplier: f64,
    pub high_multiplier: f64,
}

impl Default for PeerVolumeBand {
    fn default() -> Self {
        Self {
            low_multiplier: 0.5,
            high_multiplier: 2.0,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Universal per-request filter set describing the analysis to run.
///
/// Empty enum sets mean "no restriction" on that dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterSet {
    pub data_domain: DataDomain,
    /// Non-empty set of canonical county codes.
    pub geography: Vec<CountyCode>,
    /// Non-empty ordered set of calendar years.
    pub years: Vec<i32>,
    #[serde(default)]
    pub loan_purposes: Vec<LoanPurpose>,
    #[serde(default)]
    pub actions_taken: Vec<ActionTaken>,
    #[serde(default)]
    pub occupancy: Vec<Occupancy>,
    #[serde(default)]
    pub units: Vec<UnitsBand>,
    #[serde(default)]
    pub construction_method: Vec<ConstructionMethod>,
    #[serde(default = "default_true")]
    pub exclude_reverse_mortgage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_lender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_volume_band: Option<PeerVolumeBand>,
}

impl FilterSet {
    /// Validate the filter set against domain constraints.
    pub fn validate(&self) -> AppResult<()> {
        if self.geography.is_empty() {
            return Err(AppError::Validation("geography must be non-empty".into()));
        }
        if self.years.is_empty() {
            return Err(AppError::Validation("years must be non-empty".into()));
        }
        let supported = self.data_domain.supported_years();
        for year in &self.years {
            if !supported.contains(year) {
                return Err(AppError::Validation(format!(
                    "year {year} outside supported range {}..={} for domain {}",
                    supported.start(),
                    supported.end(),
                    self.data_domain
                )));
            }
        }
        if let Some(band) = &self.peer_volume_band {
            if band.low_multiplier <= 0.0 || band.high_multiplier <= band.low_multiplier {
                return Err(AppError::Validation(
                    "peerVolumeBand must satisfy 0 < low < high".into(),
                ));
            }
        }
        if let Some(subject) = &self.subject_lender_id {
            if subject.trim().is_empty() {
                return Err(AppError::Validation("subjectLenderId must not be blank".into()));
            }
        }
        Ok(())
    }

    /// Canonical form: county set, years and enum sets sorted and
    /// deduplicated. The canonical form is what report metadata echoes.
    pub fn canonicalize(&mut self) {
        self.geography.sort();
        self.geography.dedup();
        self.years.sort_unstable();
        self.years.dedup();
        self.loan_purposes.sort_unstable();
        self.loan_purposes.dedup();
        self.actions_taken.sort_unstable();
        self.actions_taken.dedup();
        self.occupancy.sort_unstable();
        self.occupancy.dedup();
        self.units.sort_unstable();
        self.units.dedup();
        self.construction_method.sort_unstable();
        self.construction_method.dedup();
    }

    /// Most recent requested year (years are canonicalized ascending).
    pub fn latest_year(&self) -> i32 {
        self.years.iter().copied().max().unwrap_or_default()
    }
}

/// Per-application analysis recipe selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RecipeKind {
    Mortgage,
    SmallBusiness,
    Branch,
    BankMerger,
    Explorer,
    BranchMap,
}

impl RecipeKind {
    pub fn label(&self) -> &'static str {
        match self {
            RecipeKind::Mortgage => "mortgage",
            RecipeKind::SmallBusiness => "small-business",
            RecipeKind::Branch => "branch",
            RecipeKind::BankMerger => "bank-merger",
            RecipeKind::Explorer => "explorer",
            RecipeKind::BranchMap => "branch-map",
        }
    }
}

impl std::fmt::Display for RecipeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Body of `POST /analyze`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub recipe: RecipeKind,
    pub filters: FilterSet,
}

impl AnalysisRequest {
    /// Validate and canonicalize in place.
    pub fn prepare(&mut self) -> AppResult<()> {
        self.filters.validate()?;
        self.filters.canonicalize();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_filters() -> FilterSet {
        FilterSet {
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
        }
    }

    #[test]
    fn validates_empty_geography() {
        let mut filters = base_filters();
        filters.geography.clear();
        assert!(filters.validate().is_err());
    }

    #[test]
    fn validates_year_range() {
        let mut filters = base_filters();
        filters.years = vec![1999];
        assert!(filters.validate().is_err());
        filters.years = vec![2022];
        assert!(filters.validate().is_ok());
    }

    #[test]
    fn validates_peer_band() {
        let mut filters = base_filters();
        filters.peer_volume_band = Some(PeerVolumeBand {
            low_multiplier: 2.0,
            high_multiplier: 0.5,
        });
        assert!(filters.validate().is_err());
    }

    #[test]
    fn canonicalize_sorts_and_dedups() {
        let mut filters = base_filters();
        filters.geography = vec![
            CountyCode::parse("06073").unwrap(),
            CountyCode::parse("06037").unwrap(),
            CountyCode::parse("06073").unwrap(),
        ];
        filters.years = vec![2022, 2020, 2020, 2021];
        filters.loan_purposes = vec![LoanPurpose::Refinance, LoanPurpose::HomePurchase];
        filters.canonicalize();
        assert_eq!(
            filters.geography.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            ["06037", "06073"]
        );
        assert_eq!(filters.years, vec![2020, 2021, 2022]);
        assert_eq!(
            filters.loan_purposes,
            vec![LoanPurpose::HomePurchase, LoanPurpose::Refinance]
        );
    }

    #[test]
    fn reverse_mortgage_exclusion_defaults_on() {
        let json = r#"{
            "dataDomain": "mortgage",
            "geography": ["05143"],
            "years": [2022]
        }"#;
        let filters: FilterSet = serde_json::from_str(json).unwrap();
        assert!(filters.exclude_reverse_mortgage);
    }

    #[test]
    fn filter_set_round_trips_through_json() {
        let mut filters = base_filters();
        filters.subject_lender_id = Some("L42".into());
        filters.peer_volume_band = Some(PeerVolumeBand::default());
        let json = serde_json::to_string(&filters).unwrap();
        let back: FilterSet = serde_json::from_str(&json).unwrap();
        assert_eq!(filters, back);
    }
}
