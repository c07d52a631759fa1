//! Mortgage (HMDA LAR) query builder

use super::{
    borrower_income_case_sql, county_param, mmct_case_sql, race_ethnicity_case_sql,
    tract_income_case_sql, BuiltQuery, PredicateBuilder, Projection, QueryParam,
};
use crate::models::request::FilterSet;

/// Sentinel for "this is a reverse mortgage" in the warehouse schema.
const REVERSE_MORTGAGE_YES: i16 = 1;

/// Build the LAR statement for the given filters.
///
/// The statement projects the combined race/ethnicity tag, both income
/// levels, the MMCT flag and the dedup key so that aggregation is a single
/// grouped pass downstream.
pub fn build(filters: &FilterSet) -> BuiltQuery {
    let mut predicates = PredicateBuilder::new();

    predicates.push(
        "activity_year = ANY({})",
        QueryParam::IntArray(filters.years.clone()),
    );
    predicates.push("county_code = ANY({})", county_param(filters));

    if !filters.loan_purposes.is_empty() {
        predicates.push(
            "loan_purpose = ANY({})",
            QueryParam::SmallIntArray(filters.loan_purposes.iter().map(|p| p.code()).collect()),
        );
    }
    if !filters.actions_taken.is_empty() {
        predicates.push(
            "action_taken = ANY({})",
            QueryParam::SmallIntArray(filters.actions_taken.iter().map(|a| a.code()).collect()),
        );
    }
    if !filters.occupancy.is_empty() {
        predicates.push(
            "occupancy_type = ANY({})",
            QueryParam::SmallIntArray(filters.occupancy.iter().map(|o| o.code()).collect()),
        );
    }
    if !filters.construction_method.is_empty() {
        predicates.push(
            "construction_method = ANY({})",
            QueryParam::SmallIntArray(
                filters.construction_method.iter().map(|c| c.code()).collect(),
            ),
        );
    }
    if !filters.units.is_empty() {
        predicates.push_raw(units_condition(filters));
    }
    if filters.exclude_reverse_mortgage {
        // Null means not-reverse.
        predicates.push_raw(format!(
            "(reverse_mortgage IS NULL OR reverse_mortgage <> {REVERSE_MORTGAGE_YES})"
        ));
    }

    let sql = format!(
        "SELECT \
           activity_year AS year, \
           lei AS lender_id, \
           respondent_name AS lender_name, \
           county_code, \
           census_tract AS tract_id, \
           loan_amount AS amount, \
           {race} AS race_ethnicity, \
           {borrower_income} AS borrower_income_level, \
           {tract_income} AS tract_income_level, \
           {mmct} AS is_mmct, \
           tract_minority_population_percent AS tract_minority_percent, \
           CONCAT_WS('|', activity_year, lei, county_code, census_tract, \
                     loan_purpose, loan_amount, action_taken) AS dedup_key \
         FROM hmda_lar \
         WHERE {where_clause}",
        race = race_ethnicity_case_sql(),
        borrower_income = borrower_income_case_sql(),
        tract_income = tract_income_case_sql("tract_to_msa_income_percentage"),
        mmct = mmct_case_sql("tract_minority_population_percent"),
        where_clause = predicates.where_clause(),
    );

    BuiltQuery {
        sql,
        params: predicates.into_params(),
        projection: Projection {
            has_demographics: true,
            has_borrower_income: true,
            has_tract_flags: true,
            has_lender_names: true,
        },
    }
}

/// OR-group over the requested unit bands (1..4 exact, 5+ is a floor).
fn units_condition(filters: &FilterSet) -> String {
    let alternatives: Vec<String> = filters
        .units
        .iter()
        .map(|band| match band.bounds() {
            (low, Some(high)) if low == high => format!("total_units = {low}"),
            (low, Some(high)) => format!("total_units BETWEEN {low} AND {high}"),
            (low, None) => format!("total_units >= {low}"),
        })
        .collect();
    format!("({})", alternatives.join(" OR "))
}
