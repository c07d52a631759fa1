//! Derived classifications: race/ethnicity coalescing, income levels,
//! majority-minority flags and minority quartiles.
//!
//! These pure functions are the single source of truth for the derivation
//! rules; the SQL projections emitted by the query builders mirror them
//! label-for-label.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Ethnicity codes counted as Hispanic (primary code plus subgroup codes).
const HISPANIC_CODES: [i16; 5] = [1, 11, 12, 13, 14];

/// Race codes treated as "information withheld" for the coalesce.
const WITHHELD_CODES: [i16; 2] = [6, 7];

/// Combined race/ethnicity tag for a loan record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RaceEthnicity {
    Hispanic,
    NativeAmerican,
    Asian,
    Black,
    HawaiianPacificIslander,
    White,
    NoData,
}

impl RaceEthnicity {
    /// All classes in presentation order, `NoData` last.
    pub const ALL: [RaceEthnicity; 7] = [
        RaceEthnicity::Hispanic,
        RaceEthnicity::NativeAmerican,
        RaceEthnicity::Asian,
        RaceEthnicity::Black,
        RaceEthnicity::HawaiianPacificIslander,
        RaceEthnicity::White,
        RaceEthnicity::NoData,
    ];

    /// Label used both in report tables and in the SQL projection.
    pub fn label(&self) -> &'static str {
        match self {
            RaceEthnicity::Hispanic => "Hispanic",
            RaceEthnicity::NativeAmerican => "Native American",
            RaceEthnicity::Asian => "Asian",
            RaceEthnicity::Black => "Black",
            RaceEthnicity::HawaiianPacificIslander => "Hawaiian/Pacific Islander",
            RaceEthnicity::White => "White",
            RaceEthnicity::NoData => "No Data",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "Hispanic" => RaceEthnicity::Hispanic,
            "Native American" => RaceEthnicity::NativeAmerican,
            "Asian" => RaceEthnicity::Asian,
            "Black" => RaceEthnicity::Black,
            "Hawaiian/Pacific Islander" => RaceEthnicity::HawaiianPacificIslander,
            "White" => RaceEthnicity::White,
            _ => RaceEthnicity::NoData,
        }
    }
}

impl std::fmt::Display for RaceEthnicity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Classify a record from its five ethnicity and five race code slots.
///
/// Order matters: any Hispanic ethnicity code wins; otherwise the first
/// usable race code (slots 1..5, withheld sentinels treated as null)
/// decides; otherwise `NoData`.
pub fn combined_race_ethnicity(ethnicities: &[Option<i16>], races: &[Option<i16>]) -> RaceEthnicity {
    if ethnicities
        .iter()
        .flatten()
        .any(|code| HISPANIC_CODES.contains(code))
    {
        return RaceEthnicity::Hispanic;
    }

    let first_usable = races
        .iter()
        .flatten()
        .copied()
        .find(|code| !WITHHELD_CODES.contains(code));

    match first_usable {
        Some(1) => RaceEthnicity::NativeAmerican,
        Some(2) | Some(21..=27) => RaceEthnicity::Asian,
        Some(3) => RaceEthnicity::Black,
        Some(4) | Some(41..=44) => RaceEthnicity::HawaiianPacificIslander,
        Some(5) => RaceEthnicity::White,
        _ => RaceEthnicity::NoData,
    }
}

/// Income level bucket, shared by borrower-income and tract-income
/// classifications (percent units: ≤50 low, 50..80 moderate, 80..120
/// middle, >120 upper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum IncomeLevel {
    Low,
    Moderate,
    Middle,
    Upper,
}

impl IncomeLevel {
    pub const ALL: [IncomeLevel; 4] = [
        IncomeLevel::Low,
        IncomeLevel::Moderate,
        IncomeLevel::Middle,
        IncomeLevel::Upper,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            IncomeLevel::Low => "low",
            IncomeLevel::Moderate => "moderate",
            IncomeLevel::Middle => "middle",
            IncomeLevel::Upper => "upper",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "low" => Some(IncomeLevel::Low),
            "moderate" => Some(IncomeLevel::Moderate),
            "middle" => Some(IncomeLevel::Middle),
            "upper" => Some(IncomeLevel::Upper),
            _ => None,
        }
    }

    /// Low-to-moderate income: the combined low + moderate band.
    pub fn is_lmi(&self) -> bool {
        matches!(self, IncomeLevel::Low | IncomeLevel::Moderate)
    }

    /// Bucket a percent-of-median value.
    pub fn from_percent(percent: f64) -> Self {
        if percent <= 50.0 {
            IncomeLevel::Low
        } else if percent <= 80.0 {
            IncomeLevel::Moderate
        } else if percent <= 120.0 {
            IncomeLevel::Middle
        } else {
            IncomeLevel::Upper
        }
    }
}

impl std::fmt::Display for IncomeLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Borrower income level: `(applicant income × 1000) ÷ msa median family
/// income`, expressed in percent. Undefined when the median is zero or
/// either value is missing.
pub fn borrower_income_level(
    applicant_income_thousands: Option<f64>,
    msa_median_family_income: Option<f64>,
) -> Option<IncomeLevel> {
    let income = applicant_income_thousands?;
    let median = msa_median_family_income?;
    if median <= 0.0 {
        return None;
    }
    Some(IncomeLevel::from_percent(income * 1000.0 / median * 100.0))
}

/// Tract income level from the tract-to-MSA income percentage.
pub fn tract_income_level(tract_to_msa_percent: Option<f64>) -> Option<IncomeLevel> {
    tract_to_msa_percent.map(IncomeLevel::from_percent)
}

/// Majority-minority census tract: minority population ≥ 50 percent.
pub fn is_majority_minority(tract_minority_percent: Option<f64>) -> Option<bool> {
    tract_minority_percent.map(|pct| pct >= 50.0)
}

/// Minority-tract quartile band relative to the geography's mean ± σ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MinorityQuartile {
    Low,
    Moderate,
    Middle,
    High,
}

impl MinorityQuartile {
    pub const ALL: [MinorityQuartile; 4] = [
        MinorityQuartile::Low,
        MinorityQuartile::Moderate,
        MinorityQuartile::Middle,
        MinorityQuartile::High,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MinorityQuartile::Low => "low",
            MinorityQuartile::Moderate => "moderate",
            MinorityQuartile::Middle => "middle",
            MinorityQuartile::High => "high",
        }
    }
}

/// Quartile boundaries over the minority percents of the tracts present in a
/// report: low (0..mean−σ), moderate (mean−σ..mean), middle (mean..mean+σ),
/// high (mean+σ..100). Bounds clamp to [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuartileBoundaries {
    pub mean: f64,
    pub stddev: f64,
    pub low_max: f64,
    pub moderate_max: f64,
    pub middle_max: f64,
}

impl QuartileBoundaries {
    /// Compute boundaries from `(minority percent, weight)` pairs. Weights
    /// are tract household counts; equal weights reduce to the unweighted
    /// population statistics. Returns `None` when total weight is zero.
    pub fn from_weighted(tracts: &[(f64, f64)]) -> Option<Self> {
        let total_weight: f64 = tracts.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return None;
        }
        let mean = tracts.iter().map(|(pct, w)| pct * w).sum::<f64>() / total_weight;
        let variance = tracts
            .iter()
            .map(|(pct, w)| w * (pct - mean).powi(2))
            .sum::<f64>()
            / total_weight;
        let stddev = variance.sqrt();
        Some(Self {
            mean,
            stddev,
            low_max: (mean - stddev).clamp(0.0, 100.0),
            moderate_max: mean.clamp(0.0, 100.0),
            middle_max: (mean + stddev).clamp(0.0, 100.0),
        })
    }

    pub fn classify(&self, minority_percent: f64) -> MinorityQuartile {
        if minority_percent <= self.low_max {
            MinorityQuartile::Low
        } else if minority_percent <= self.moderate_max {
            MinorityQuartile::Moderate
        } else if minority_percent <= self.middle_max {
            MinorityQuartile::Middle
        } else {
            MinorityQuartile::High
        }
    }
}
