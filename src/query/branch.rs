//! Bank-branch (summary of deposits) query builder

use super::{
    county_param, mmct_case_sql, tract_income_case_sql, BuiltQuery, PredicateBuilder, Projection,
    QueryParam,
};
use crate::models::request::FilterSet;

/// Build the branch statement. Deposits ride in the amount column
/// (warehouse-native thousands, like loan amounts).
pub fn build(filters: &FilterSet) -> BuiltQuery {
    let mut predicates = PredicateBuilder::new();
    predicates.push(
        "activity_year = ANY({})",
        QueryParam::IntArray(filters.years.clone()),
    );
    predicates.push("county_code = ANY({})", county_param(filters));

    let sql = format!(
        "SELECT \
           activity_year AS year, \
           institution_cert AS lender_id, \
           institution_name AS lender_name, \
           county_code, \
           census_tract AS tract_id, \
           deposits AS amount, \
           'No Data' AS race_ethnicity, \
           NULL AS borrower_income_level, \
           {tract_income} AS tract_income_level, \
           {mmct} AS is_mmct, \
           tract_minority_population_percent AS tract_minority_percent, \
           CONCAT_WS('|', activity_year, branch_uid) AS dedup_key \
         FROM branch_deposits \
         WHERE {where_clause}",
        tract_income = tract_income_case_sql("tract_to_msa_income_percentage"),
        mmct = mmct_case_sql("tract_minority_population_percent"),
        where_clause = predicates.where_clause(),
    );

    BuiltQuery {
        sql,
        params: predicates.into_params(),
        projection: Projection {
            has_demographics: false,
            has_borrower_income: false,
            has_tract_flags: true,
            has_lender_names: true,
        },
    }
}
