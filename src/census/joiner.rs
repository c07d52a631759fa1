//! Demographic context joiner: fetches census data for a job's geography
//! and weaves it into the report tables.

use std::collections::HashMap;

use super::{CensusError, CensusSource, DemographicsRow, TractRow};
use crate::engine::aggregate::TractYearRollup;
use crate::models::classification::{
    IncomeLevel, MinorityQuartile, QuartileBoundaries, RaceEthnicity,
};
use crate::models::geography::{CountyCode, Vintage};
use crate::models::report::{
    DemographicContext, DemographicRow, IncomeNeighborhoodTable, QuartileRow, ShareCell,
    VintageDemographics,
};

pub struct DemographicJoiner<'a> {
    census: &'a dyn CensusSource,
}

impl<'a> DemographicJoiner<'a> {
    pub fn new(census: &'a dyn CensusSource) -> Self {
        Self { census }
    }

    /// Fetch county demographics for each required vintage and combine
    /// multi-county geographies (summed counts; percent fields weighted by
    /// population, which summing the counts yields directly).
    pub async fn build_context(
        &self,
        geography: &[CountyCode],
        vintages: &[Vintage],
    ) -> Result<DemographicContext, CensusError> {
        let mut out = DemographicContext::default();
        for vintage in vintages {
            let rows = self.census.county_demographics(geography, *vintage).await?;
            out.vintages.push(combine_counties(*vintage, &rows));
        }
        Ok(out)
    }

    /// Fetch tract distributions for the most recent vintage, compute
    /// household-weighted minority-quartile boundaries over the tracts
    /// present in the report, re-bucket the quartile rows, and attach
    /// census shares to the neighborhood table.
    pub async fn join_tracts(
        &self,
        geography: &[CountyCode],
        vintage: Vintage,
        rollup: &[TractYearRollup],
        table: &mut IncomeNeighborhoodTable,
    ) -> Result<(), CensusError> {
        let tracts = self.census.tract_distributions(geography, vintage).await?;
        let by_id: HashMap<&str, &TractRow> =
            tracts.iter().map(|t| (t.tract_id.as_str(), t)).collect();

        // Boundaries over tracts appearing in the report, weighted by
        // census household counts (weight 1 when the tract is unknown to
        // the census response).
        let mut seen: HashMap<&str, (f64, f64)> = HashMap::new();
        for entry in rollup {
            let census_tract = by_id.get(entry.tract_id.as_str());
            let minority = census_tract
                .and_then(|t| t.minority_percent)
                .or(entry.minority_percent);
            let weight = census_tract
                .map(|t| t.households as f64)
                .filter(|w| *w > 0.0)
                .unwrap_or(1.0);
            if let Some(pct) = minority {
                seen.insert(entry.tract_id.as_str(), (pct, weight));
            }
        }
        let weighted: Vec<(f64, f64)> = seen.values().copied().collect();
        let Some(bounds) = QuartileBoundaries::from_weighted(&weighted) else {
            return Ok(());
        };

        re_bucket_quartiles(rollup, &by_id, &bounds, table);
        attach_census_shares(&tracts, &bounds, table);
        table.quartile_boundaries = Some(bounds);
        Ok(())
    }

    /// Attach population shares to the demographic rows from the given
    /// vintage of the context.
    pub fn join_population_shares(
        context: &DemographicContext,
        vintage: Vintage,
        by_demographic: &mut [DemographicRow],
    ) {
        let Some(ctx) = context.vintages.iter().find(|v| v.vintage == vintage) else {
            return;
        };
        for row in by_demographic.iter_mut() {
            row.share_of_population = match row.group {
                RaceEthnicity::Hispanic => Some(ctx.hispanic.share),
                RaceEthnicity::NativeAmerican => Some(ctx.native_american.share),
                RaceEthnicity::Asian => Some(ctx.asian.share),
                RaceEthnicity::Black => Some(ctx.black.share),
                RaceEthnicity::HawaiianPacificIslander => {
                    Some(ctx.hawaiian_pacific_islander.share)
                }
                RaceEthnicity::White => Some(ctx.white.share),
                RaceEthnicity::NoData => None,
            };
        }
    }
}

fn share_cell(population: i64, total: i64) -> ShareCell {
    ShareCell {
        population,
        share: if total > 0 {
            population as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    }
}

fn combine_counties(vintage: Vintage, rows: &[DemographicsRow]) -> VintageDemographics {
    let total: i64 = rows.iter().map(|r| r.total_population).sum();
    let sum = |f: fn(&DemographicsRow) -> i64| rows.iter().map(f).sum::<i64>();
    VintageDemographics {
        vintage,
        total_population: total,
        hispanic: share_cell(sum(|r| r.hispanic), total),
        native_american: share_cell(sum(|r| r.native_american), total),
        asian: share_cell(sum(|r| r.asian), total),
        black: share_cell(sum(|r| r.black), total),
        hawaiian_pacific_islander: share_cell(sum(|r| r.hawaiian_pacific_islander), total),
        white: share_cell(sum(|r| r.white), total),
        other: share_cell(sum(|r| r.other), total),
        two_or_more: share_cell(sum(|r| r.two_or_more), total),
    }
}

/// Recompute the per-year quartile rows under census-weighted boundaries.
fn re_bucket_quartiles(
    rollup: &[TractYearRollup],
    by_id: &HashMap<&str, &TractRow>,
    bounds: &QuartileBoundaries,
    table: &mut IncomeNeighborhoodTable,
) {
    let mut acc: HashMap<(i32, MinorityQuartile), (i64, f64)> = HashMap::new();
    let mut years: Vec<i32> = Vec::new();
    for entry in rollup {
        let minority = by_id
            .get(entry.tract_id.as_str())
            .and_then(|t| t.minority_percent)
            .or(entry.minority_percent);
        let Some(pct) = minority else { continue };
        let quartile = bounds.classify(pct);
        let cell = acc.entry((entry.year, quartile)).or_insert((0, 0.0));
        cell.0 += entry.count;
        cell.1 += entry.amount;
        if !years.contains(&entry.year) {
            years.push(entry.year);
        }
    }
    years.sort_unstable();

    let mut rows = Vec::new();
    for year in years {
        let year_total: i64 = MinorityQuartile::ALL
            .iter()
            .filter_map(|q| acc.get(&(year, *q)).map(|c| c.0))
            .sum();
        for quartile in MinorityQuartile::ALL {
            let (count, amount) = acc.get(&(year, quartile)).copied().unwrap_or((0, 0.0));
            rows.push(QuartileRow {
                year,
                quartile,
                count,
                amount,
                lending_share: if year_total > 0 {
                    Some(count as f64 / year_total as f64 * 100.0)
                } else {
                    None
                },
                census_share: None,
            });
        }
    }
    table.minority_quartiles = rows;
}

/// Census shares: household share per minority quartile, and household
/// share per tract-income level (tract median income relative to the
/// household-weighted mean across the geography, percent units).
fn attach_census_shares(
    tracts: &[TractRow],
    bounds: &QuartileBoundaries,
    table: &mut IncomeNeighborhoodTable,
) {
    let total_households: i64 = tracts.iter().map(|t| t.households).sum();
    if total_households <= 0 {
        return;
    }

    let mut per_quartile: HashMap<MinorityQuartile, i64> = HashMap::new();
    for tract in tracts {
        if let Some(pct) = tract.minority_percent {
            *per_quartile.entry(bounds.classify(pct)).or_insert(0) += tract.households;
        }
    }
    for row in table.minority_quartiles.iter_mut() {
        row.census_share = per_quartile
            .get(&row.quartile)
            .map(|h| *h as f64 / total_households as f64 * 100.0);
    }

    let income_weight: f64 = tracts
        .iter()
        .filter(|t| t.median_income.is_some())
        .map(|t| t.households as f64)
        .sum();
    if income_weight <= 0.0 {
        return;
    }
    let mean_income: f64 = tracts
        .iter()
        .filter_map(|t| t.median_income.map(|m| m * t.households as f64))
        .sum::<f64>()
        / income_weight;
    if mean_income <= 0.0 {
        return;
    }

    let mut per_level: HashMap<IncomeLevel, i64> = HashMap::new();
    for tract in tracts {
        if let Some(median) = tract.median_income {
            let level = IncomeLevel::from_percent(median / mean_income * 100.0);
            *per_level.entry(level).or_insert(0) += tract.households;
        }
    }
    for row in table.tract.iter_mut() {
        row.census_share = per_level
            .get(&row.level)
            .map(|h| *h as f64 / total_households as f64 * 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::MockCensusSource;

    fn demo_row(county: &str, total: i64, hispanic: i64, white: i64) -> DemographicsRow {
        DemographicsRow {
            county: CountyCode::parse(county).unwrap(),
            total_population: total,
            hispanic,
            native_american: 0,
            asian: 0,
            black: 0,
            hawaiian_pacific_islander: 0,
            white,
            other: 0,
            two_or_more: 0,
        }
    }

    #[tokio::test]
    async fn multi_county_context_weights_by_population() {
        let mut census = MockCensusSource::new();
        census.expect_county_demographics().returning(|_, _| {
            Ok(vec![
                demo_row("06037", 1_000_000, 500_000, 300_000),
                demo_row("06059", 500_000, 100_000, 300_000),
            ])
        });
        let joiner = DemographicJoiner::new(&census);
        let geography = vec![
            CountyCode::parse("06037").unwrap(),
            CountyCode::parse("06059").unwrap(),
        ];
        let context = joiner
            .build_context(&geography, &[Vintage::Decennial2020])
            .await
            .unwrap();

        let vintage = &context.vintages[0];
        assert_eq!(vintage.total_population, 1_500_000);
        // 600k Hispanic over 1.5M = 40%, the population-weighted average of
        // the county shares (50% and 20%).
        assert!((vintage.hispanic.share - 40.0).abs() < 1e-9);
        assert_eq!(vintage.hispanic.population, 600_000);
    }

    #[tokio::test]
    async fn tract_join_recomputes_quartiles_and_shares() {
        let mut census = MockCensusSource::new();
        census.expect_tract_distributions().returning(|_, _| {
            Ok(vec![
                TractRow {
                    tract_id: "06037000100".into(),
                    households: 1000,
                    median_income: Some(40_000.0),
                    minority_percent: Some(80.0),
                },
                TractRow {
                    tract_id: "06037000200".into(),
                    households: 1000,
                    median_income: Some(120_000.0),
                    minority_percent: Some(20.0),
                },
            ])
        });
        let joiner = DemographicJoiner::new(&census);
        let geography = vec![CountyCode::parse("06037").unwrap()];
        let rollup = vec![
            TractYearRollup {
                tract_id: "06037000100".into(),
                year: 2022,
                count: 30,
                amount: 4500.0,
                minority_percent: Some(80.0),
            },
            TractYearRollup {
                tract_id: "06037000200".into(),
                year: 2022,
                count: 70,
                amount: 10_500.0,
                minority_percent: Some(20.0),
            },
        ];
        let mut table = IncomeNeighborhoodTable::default();
        joiner
            .join_tracts(&geography, Vintage::AcsLatest, &rollup, &mut table)
            .await
            .unwrap();

        let bounds = table.quartile_boundaries.unwrap();
        assert!((bounds.mean - 50.0).abs() < 1e-9);
        assert!((bounds.stddev - 30.0).abs() < 1e-9);

        // 80% minority sits at middle_max (mean + σ = 80), 20% at low_max.
        let middle: Vec<_> = table
            .minority_quartiles
            .iter()
            .filter(|r| r.quartile == MinorityQuartile::Middle && r.count > 0)
            .collect();
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].count, 30);
        assert!((middle[0].census_share.unwrap() - 50.0).abs() < 1e-9);

        let low: Vec<_> = table
            .minority_quartiles
            .iter()
            .filter(|r| r.quartile == MinorityQuartile::Low && r.count > 0)
            .collect();
        assert_eq!(low[0].count, 70);
    }

    #[test]
    fn population_share_join_skips_no_data() {
        let context = DemographicContext {
            vintages: vec![VintageDemographics {
                vintage: Vintage::AcsLatest,
                total_population: 100,
                hispanic: ShareCell { population: 30, share: 30.0 },
                native_american: ShareCell::default(),
                asian: ShareCell::default(),
                black: ShareCell::default(),
                hawaiian_pacific_islander: ShareCell::default(),
                white: ShareCell { population: 70, share: 70.0 },
                other: ShareCell::default(),
                two_or_more: ShareCell::default(),
            }],
        };
        let mut rows = vec![
            DemographicRow {
                year: 2022,
                group: RaceEthnicity::Hispanic,
                count: 10,
                amount: 0.0,
                share_of_total: None,
                share_of_population: None,
            },
            DemographicRow {
                year: 2022,
                group: RaceEthnicity::NoData,
                count: 5,
                amount: 0.0,
                share_of_total: None,
                share_of_population: None,
            },
        ];
        DemographicJoiner::join_population_shares(&context, Vintage::AcsLatest, &mut rows);
        assert_eq!(rows[0].share_of_population, Some(30.0));
        assert_eq!(rows[1].share_of_population, None);
    }
}
