//! Query builders: pure functions from a `FilterSet` to a parameterized
//! warehouse statement plus a projection descriptor.
//!
//! Builders never talk to the warehouse; tests check query shape and
//! parameter lists directly.

pub mod branch;
pub mod mortgage;
pub mod small_business;

use sha2::{Digest, Sha256};

use crate::models::request::{DataDomain, FilterSet};

/// A bind parameter for a built statement, in `$1..$n` order.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    StrArray(Vec<String>),
    IntArray(Vec<i32>),
    SmallIntArray(Vec<i16>),
}

/// Which derived-classification columns the aggregation engine may expect
/// from the decoded rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection {
    /// Rows carry the combined race/ethnicity tag.
    pub has_demographics: bool,
    /// Rows carry the borrower income level.
    pub has_borrower_income: bool,
    /// Rows carry tract income level, MMCT flag and minority percent.
    pub has_tract_flags: bool,
    /// Rows carry lender display names.
    pub has_lender_names: bool,
}

/// A parameterized statement plus its projection.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub projection: Projection,
}

impl BuiltQuery {
    /// SHA-256 over statement text and parameters, recorded in report
    /// metadata for provenance.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        for param in &self.params {
            hasher.update(format!("{param:?}").as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Dispatch to the domain builder.
pub fn build(filters: &FilterSet) -> BuiltQuery {
    match filters.data_domain {
        DataDomain::Mortgage => mortgage::build(filters),
        DataDomain::SmallBusiness => small_business::build(filters),
        DataDomain::Branch => branch::build(filters),
    }
}

/// Coalesce of the five race code slots with the "information withheld"
/// sentinels (6, 7) treated as null.
fn coalesced_race_expr() -> String {
    let slots: Vec<String> = (1..=5)
        .map(|i| format!("NULLIF(NULLIF(applicant_race_{i}, 6), 7)"))
        .collect();
    format!("COALESCE({})", slots.join(", "))
}

/// The canonical combined race/ethnicity CASE expression. Emitted exactly
/// once per mortgage statement; every recipe shares this builder. Labels
/// match `RaceEthnicity::label`.
pub(crate) fn race_ethnicity_case_sql() -> String {
    let hispanic: Vec<String> = (1..=5)
        .map(|i| format!("applicant_ethnicity_{i} IN (1, 11, 12, 13, 14)"))
        .collect();
    let race = coalesced_race_expr();
    format!(
        "CASE \
         WHEN {hispanic} THEN 'Hispanic' \
         WHEN {race} = 1 THEN 'Native American' \
         WHEN {race} = 2 OR {race} BETWEEN 21 AND 27 THEN 'Asian' \
         WHEN {race} = 3 THEN 'Black' \
         WHEN {race} = 4 OR {race} BETWEEN 41 AND 44 THEN 'Hawaiian/Pacific Islander' \
         WHEN {race} = 5 THEN 'White' \
         ELSE 'No Data' END",
        hispanic = hispanic.join(" OR "),
    )
}

/// Borrower income level CASE (percent units). NULL when
/// applicant income or the MSA median is missing or the median is zero.
pub(crate) fn borrower_income_case_sql() -> &'static str {
    "CASE \
     WHEN income IS NULL OR ffiec_msa_md_median_family_income IS NULL \
          OR ffiec_msa_md_median_family_income <= 0 THEN NULL \
     WHEN income * 1000.0 / ffiec_msa_md_median_family_income * 100.0 <= 50 THEN 'low' \
     WHEN income * 1000.0 / ffiec_msa_md_median_family_income * 100.0 <= 80 THEN 'moderate' \
     WHEN income * 1000.0 / ffiec_msa_md_median_family_income * 100.0 <= 120 THEN 'middle' \
     ELSE 'upper' END"
}

/// Tract income level CASE over the tract-to-MSA income percentage.
pub(crate) fn tract_income_case_sql(column: &str) -> String {
    format!(
        "CASE \
         WHEN {column} IS NULL THEN NULL \
         WHEN {column} <= 50 THEN 'low' \
         WHEN {column} <= 80 THEN 'moderate' \
         WHEN {column} <= 120 THEN 'middle' \
         ELSE 'upper' END"
    )
}

/// Majority-minority tract flag over the minority population percent.
pub(crate) fn mmct_case_sql(column: &str) -> String {
    format!(
        "CASE WHEN {column} IS NULL THEN NULL WHEN {column} >= 50 THEN TRUE ELSE FALSE END"
    )
}

/// Helper collecting predicates and bind parameters with `$n` numbering.
#[derive(Debug, Default)]
pub(crate) struct PredicateBuilder {
    conditions: Vec<String>,
    params: Vec<QueryParam>,
}

impl PredicateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a parameterized condition; `{}` in the fragment is replaced by
    /// the parameter placeholder.
    pub fn push(&mut self, fragment: &str, param: QueryParam) {
        self.params.push(param);
        let placeholder = format!("${}", self.params.len());
        self.conditions.push(fragment.replace("{}", &placeholder));
    }

    /// Push a condition with no parameter.
    pub fn push_raw(&mut self, condition: impl Into<String>) {
        self.conditions.push(condition.into());
    }

    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            "TRUE".to_string()
        } else {
            self.conditions.join(" AND ")
        }
    }

    pub fn into_params(self) -> Vec<QueryParam> {
        self.params
    }
}

/// County codes as a text-array bind value, zero-padded to five characters.
pub(crate) fn county_param(filters: &FilterSet) -> QueryParam {
    QueryParam::StrArray(
        filters
            .geography
            .iter()
            .map(|c| c.as_str().to_string())
            .collect(),
    )
}
