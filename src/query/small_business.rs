//! Small-business (CRA disclosure) query builder

use super::{
    county_param, mmct_case_sql, tract_income_case_sql, BuiltQuery, PredicateBuilder, Projection,
    QueryParam,
};
use crate::models::request::FilterSet;

/// Build the small-business lending statement.
///
/// The CRA schema has no applicant demographics or income; tract-level
/// classifications still apply.
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
           respondent_id AS lender_id, \
           respondent_name AS lender_name, \
           county_code, \
           census_tract AS tract_id, \
           loan_amount AS amount, \
           'No Data' AS race_ethnicity, \
           NULL AS borrower_income_level, \
           {tract_income} AS tract_income_level, \
           {mmct} AS is_mmct, \
           tract_minority_population_percent AS tract_minority_percent, \
           id::text AS dedup_key \
         FROM sb_lending \
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::geography::CountyCode;
    use crate::models::request::DataDomain;

    #[test]
    fn builds_tract_level_projection_only() {
        let filters = FilterSet {
            data_domain: DataDomain::SmallBusiness,
            geography: vec![CountyCode::parse("48201").unwrap()],
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
        let built = build(&filters);
        assert!(built.sql.contains("FROM sb_lending"));
        assert!(!built.projection.has_demographics);
        assert!(!built.projection.has_borrower_income);
        assert!(built.projection.has_tract_flags);
        assert_eq!(built.params.len(), 2);
        // Mortgage-only filters never leak into the small-business statement.
        assert!(!built.sql.contains("loan_purpose"));
        assert!(!built.sql.contains("reverse_mortgage"));
    }
}
