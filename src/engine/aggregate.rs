//! Aggregation engine: one pass over the decoded warehouse rows producing
//! every report table.
//!
//! Accumulators carry warehouse-native thousands of dollars; the ×1000
//! conversion to dollars happens when report rows are built.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::classification::{
    IncomeLevel, MinorityQuartile, QuartileBoundaries, RaceEthnicity,
};
use crate::models::geography::CountyCode;
use crate::models::report::{
    ConcentrationBasis, ConcentrationCategory, ConcentrationRow, CountAmount, DemographicRow,
    IncomeBucketRow, IncomeMissingRow, IncomeNeighborhoodTable, LenderRow, LenderTable,
    LenderYearRow, PeerComparison, PeerMeans, QuartileRow, ShareDenominator, SummaryRow,
    TrendDirection, TrendRow,
};
use crate::models::request::FilterSet;
use crate::models::LoanRow;

/// Aggregation knobs selected by the recipe.
#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub top_lenders: usize,
    pub concentration_basis: ConcentrationBasis,
    pub denominator: ShareDenominator,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            top_lenders: 10,
            concentration_basis: ConcentrationBasis::Amounts,
            denominator: ShareDenominator::TotalForYear,
        }
    }
}

/// Per-(tract, year) rollup kept for the census joiner, which may
/// re-bucket minority quartiles under household-weighted boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct TractYearRollup {
    pub tract_id: String,
    pub year: i32,
    pub count: i64,
    /// Dollars, consistent with report rows.
    pub amount: f64,
    pub minority_percent: Option<f64>,
}

/// Everything the single aggregation pass produces. `by_lender_full` keeps
/// the untruncated ranking for exporters and the peer computation; the
/// report carries the top-N table.
#[derive(Debug, Clone, Default)]
pub struct Aggregates {
    pub summary: Vec<SummaryRow>,
    pub by_demographic: Vec<DemographicRow>,
    pub by_income_neighborhood: IncomeNeighborhoodTable,
    pub by_lender: LenderTable,
    pub by_lender_full: Vec<LenderRow>,
    pub by_lender_by_year: Vec<LenderYearRow>,
    pub concentration: Vec<ConcentrationRow>,
    pub trends: Vec<TrendRow>,
    pub peer_comparison: Option<PeerComparison>,
    pub tract_rollup: Vec<TractYearRollup>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Acc {
    count: i64,
    amount_thousands: f64,
}

impl Acc {
    fn add(&mut self, amount_thousands: f64) {
        self.count += 1;
        self.amount_thousands += amount_thousands;
    }

    fn dollars(&self) -> CountAmount {
        CountAmount {
            count: self.count,
            amount: self.amount_thousands * 1000.0,
        }
    }
}

#[derive(Debug, Default)]
struct GroupAcc {
    total: Acc,
    demographics: BTreeMap<RaceEthnicity, Acc>,
    lmi_tract: Acc,
    lmi_borrower: Acc,
    mmct: Acc,
}

impl GroupAcc {
    fn add(&mut self, row: &LoanRow, amount: f64) {
        self.total.add(amount);
        self.demographics.entry(row.race_ethnicity).or_default().add(amount);
        if row.tract_income_level.is_some_and(|l| l.is_lmi()) {
            self.lmi_tract.add(amount);
        }
        if row.borrower_income_level.is_some_and(|l| l.is_lmi()) {
            self.lmi_borrower.add(amount);
        }
        if row.is_mmct == Some(true) {
            self.mmct.add(amount);
        }
    }

    fn demographics_dollars(&self) -> BTreeMap<RaceEthnicity, CountAmount> {
        RaceEthnicity::ALL
            .iter()
            .map(|class| {
                (
                    *class,
                    self.demographics.get(class).copied().unwrap_or_default().dollars(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct LenderAcc {
    name: Option<String>,
    group: GroupAcc,
    per_year: BTreeMap<i32, Acc>,
}

fn percent(count: i64, denominator: i64) -> Option<f64> {
    if denominator > 0 {
        Some(count as f64 / denominator as f64 * 100.0)
    } else {
        None
    }
}

/// Run the aggregation pass.
pub fn aggregate(rows: &[LoanRow], filters: &FilterSet, options: &AggregateOptions) -> Aggregates {
    let mut seen_keys: HashSet<&str> = HashSet::with_capacity(rows.len());

    let mut summary: BTreeMap<(CountyCode, i32), GroupAcc> = BTreeMap::new();
    let mut year_totals: BTreeMap<i32, Acc> = BTreeMap::new();
    let mut by_demo: BTreeMap<(i32, RaceEthnicity), Acc> = BTreeMap::new();
    let mut borrower_income: BTreeMap<(i32, IncomeLevel), Acc> = BTreeMap::new();
    let mut tract_income: BTreeMap<(i32, IncomeLevel), Acc> = BTreeMap::new();
    let mut missing: BTreeMap<i32, IncomeMissingRow> = BTreeMap::new();
    let mut tract_rollup: HashMap<(String, i32), (Acc, Option<f64>)> = HashMap::new();
    let mut lenders: HashMap<String, LenderAcc> = HashMap::new();

    for row in rows {
        // Rows sharing a dedup key are counted once.
        if !seen_keys.insert(row.dedup_key.as_str()) {
            continue;
        }
        let amount = row.amount.unwrap_or(0.0);

        summary
            .entry((row.county.clone(), row.year))
            .or_default()
            .add(row, amount);
        year_totals.entry(row.year).or_default().add(amount);
        by_demo.entry((row.year, row.race_ethnicity)).or_default().add(amount);

        let missing_row = missing.entry(row.year).or_insert(IncomeMissingRow {
            year: row.year,
            missing_borrower_income: 0,
            missing_tract_income: 0,
        });
        match row.borrower_income_level {
            Some(level) => borrower_income.entry((row.year, level)).or_default().add(amount),
            None => missing_row.missing_borrower_income += 1,
        }
        match row.tract_income_level {
            Some(level) => tract_income.entry((row.year, level)).or_default().add(amount),
            None => missing_row.missing_tract_income += 1,
        }

        if let Some(tract) = &row.tract_id {
            let entry = tract_rollup
                .entry((tract.clone(), row.year))
                .or_insert((Acc::default(), None));
            entry.0.add(amount);
            if entry.1.is_none() {
                entry.1 = row.tract_minority_percent;
            }
        }

        let lender = lenders.entry(row.lender_id.clone()).or_default();
        if lender.name.is_none() {
            lender.name = row.lender_name.clone();
        }
        lender.group.add(row, amount);
        lender.per_year.entry(row.year).or_default().add(amount);
    }

    let latest_year = filters.latest_year();

    // Per-lender year cells survive the lender consumption below; the
    // concentration pass runs over the full set, not the top-N panel.
    let per_year: HashMap<String, BTreeMap<i32, Acc>> = lenders
        .iter()
        .map(|(id, acc)| (id.clone(), acc.per_year.clone()))
        .collect();

    let mut out = Aggregates::default();
    build_summary(&mut out, summary);
    build_by_demographic(&mut out, &by_demo, &year_totals, filters, options);
    build_income_neighborhood(&mut out, &borrower_income, &tract_income, missing, filters);

    out.tract_rollup = tract_rollup
        .into_iter()
        .map(|((tract_id, year), (acc, minority))| TractYearRollup {
            tract_id,
            year,
            count: acc.count,
            amount: acc.amount_thousands * 1000.0,
            minority_percent: minority,
        })
        .collect();
    out.tract_rollup
        .sort_by(|a, b| (a.year, &a.tract_id).cmp(&(b.year, &b.tract_id)));
    build_minority_quartiles(&mut out);

    build_lenders(&mut out, lenders, latest_year, options);
    build_lender_year_panels(&mut out, &per_year, filters);
    build_concentration(&mut out, &per_year, filters, options);
    build_trends(&mut out, filters, &year_totals);
    build_peer_comparison(&mut out, filters, latest_year);
    out
}

fn build_summary(out: &mut Aggregates, summary: BTreeMap<(CountyCode, i32), GroupAcc>) {
    out.summary = summary
        .into_iter()
        .map(|((county, year), acc)| SummaryRow {
            county,
            year,
            total: acc.total.dollars(),
            demographics: acc.demographics_dollars(),
            lmi_tract: acc.lmi_tract.dollars(),
            lmi_borrower: acc.lmi_borrower.dollars(),
            mmct: acc.mmct.dollars(),
        })
        .collect();
}

fn build_by_demographic(
    out: &mut Aggregates,
    by_demo: &BTreeMap<(i32, RaceEthnicity), Acc>,
    year_totals: &BTreeMap<i32, Acc>,
    filters: &FilterSet,
    options: &AggregateOptions,
) {
    let mut rows = Vec::new();
    for &year in &filters.years {
        let denominator = match options.denominator {
            ShareDenominator::ClassificationGroup => RaceEthnicity::ALL
                .iter()
                .filter_map(|c| by_demo.get(&(year, *c)).map(|a| a.count))
                .sum(),
            _ => year_totals.get(&year).map(|a| a.count).unwrap_or(0),
        };
        for class in RaceEthnicity::ALL {
            let acc = by_demo.get(&(year, class)).copied().unwrap_or_default();
            rows.push(DemographicRow {
                year,
                group: class,
                count: acc.count,
                amount: acc.amount_thousands * 1000.0,
                share_of_total: percent(acc.count, denominator),
                share_of_population: None,
            });
        }
    }
    out.by_demographic = rows;
}

fn build_income_neighborhood(
    out: &mut Aggregates,
    borrower_income: &BTreeMap<(i32, IncomeLevel), Acc>,
    tract_income: &BTreeMap<(i32, IncomeLevel), Acc>,
    missing: BTreeMap<i32, IncomeMissingRow>,
    filters: &FilterSet,
) {
    // Income shares always exclude rows missing the classification input,
    // so the denominator is the sum of the bucketed counts.
    let bucket_rows = |acc: &BTreeMap<(i32, IncomeLevel), Acc>| -> Vec<IncomeBucketRow> {
        let mut rows = Vec::new();
        for &year in &filters.years {
            let bucketed_total: i64 = IncomeLevel::ALL
                .iter()
                .filter_map(|l| acc.get(&(year, *l)).map(|a| a.count))
                .sum();
            for level in IncomeLevel::ALL {
                let cell = acc.get(&(year, level)).copied().unwrap_or_default();
                rows.push(IncomeBucketRow {
                    year,
                    level,
                    count: cell.count,
                    amount: cell.amount_thousands * 1000.0,
                    lending_share: percent(cell.count, bucketed_total),
                    census_share: None,
                });
            }
        }
        rows
    };

    out.by_income_neighborhood = IncomeNeighborhoodTable {
        borrower: bucket_rows(borrower_income),
        tract: bucket_rows(tract_income),
        minority_quartiles: Vec::new(),
        quartile_boundaries: None,
        missing: missing.into_values().collect(),
    };
}

/// Initial quartile rows from warehouse-derived tract minority percents
/// (each tract weighted equally); the census joiner re-buckets these with
/// household weights when tract distributions are available.
fn build_minority_quartiles(out: &mut Aggregates) {
    let mut distinct: HashMap<&str, f64> = HashMap::new();
    for entry in &out.tract_rollup {
        if let Some(pct) = entry.minority_percent {
            distinct.entry(entry.tract_id.as_str()).or_insert(pct);
        }
    }
    let weighted: Vec<(f64, f64)> = distinct.values().map(|pct| (*pct, 1.0)).collect();
    let Some(bounds) = QuartileBoundaries::from_weighted(&weighted) else {
        return;
    };

    let mut acc: BTreeMap<(i32, MinorityQuartile), Acc> = BTreeMap::new();
    let mut years: Vec<i32> = Vec::new();
    for entry in &out.tract_rollup {
        let Some(pct) = entry.minority_percent else { continue };
        let quartile = bounds.classify(pct);
        let cell = acc.entry((entry.year, quartile)).or_default();
        cell.count += entry.count;
        cell.amount_thousands += entry.amount / 1000.0;
        if !years.contains(&entry.year) {
            years.push(entry.year);
        }
    }
    years.sort_unstable();

    let mut rows = Vec::new();
    for year in years {
        let year_total: i64 = MinorityQuartile::ALL
            .iter()
            .filter_map(|q| acc.get(&(year, *q)).map(|c| c.count))
            .sum();
        for quartile in MinorityQuartile::ALL {
            let cell = acc.get(&(year, quartile)).copied().unwrap_or_default();
            rows.push(QuartileRow {
                year,
                quartile,
                count: cell.count,
                amount: cell.amount_thousands * 1000.0,
                lending_share: percent(cell.count, year_total),
                census_share: None,
            });
        }
    }
    out.by_income_neighborhood.minority_quartiles = rows;
    out.by_income_neighborhood.quartile_boundaries = Some(bounds);
}

fn build_lenders(
    out: &mut Aggregates,
    lenders: HashMap<String, LenderAcc>,
    latest_year: i32,
    options: &AggregateOptions,
) {
    let mut full: Vec<LenderRow> = lenders
        .into_iter()
        .map(|(lender_id, acc)| LenderRow {
            lender_id,
            lender_name: acc.name,
            latest_year_count: acc.per_year.get(&latest_year).map(|a| a.count).unwrap_or(0),
            total: acc.group.total.dollars(),
            demographics: acc.group.demographics_dollars(),
            lmi_tract: acc.group.lmi_tract.dollars(),
            lmi_borrower: acc.group.lmi_borrower.dollars(),
            mmct: acc.group.mmct.dollars(),
        })
        .collect();

    // Ties on the latest-year total break by lender identifier ascending.
    full.sort_by(|a, b| {
        b.latest_year_count
            .cmp(&a.latest_year_count)
            .then_with(|| a.lender_id.cmp(&b.lender_id))
    });

    let top_n = options.top_lenders.max(1);
    let shown: Vec<LenderRow> = full.iter().take(top_n).cloned().collect();

    out.by_lender = LenderTable {
        truncated: full.len() > shown.len(),
        total_lenders: full.len(),
        lenders: shown,
    };
    out.by_lender_full = full;
}

/// Per-year panels for the truncated lender set.
fn build_lender_year_panels(
    out: &mut Aggregates,
    per_year: &HashMap<String, BTreeMap<i32, Acc>>,
    filters: &FilterSet,
) {
    let mut rows = Vec::new();
    for lender in &out.by_lender.lenders {
        for &year in &filters.years {
            let cell = per_year
                .get(&lender.lender_id)
                .and_then(|m| m.get(&year))
                .copied()
                .unwrap_or_default();
            rows.push(LenderYearRow {
                lender_id: lender.lender_id.clone(),
                year,
                count: cell.count,
                amount: cell.amount_thousands * 1000.0,
            });
        }
    }
    out.by_lender_by_year = rows;
}

fn build_concentration(
    out: &mut Aggregates,
    per_year: &HashMap<String, BTreeMap<i32, Acc>>,
    filters: &FilterSet,
    options: &AggregateOptions,
) {
    // Market shares per year over the full lender set; HHI is the sum of
    // squared percent shares.
    let mut rows = Vec::new();
    for &year in &filters.years {
        let values: Vec<f64> = per_year
            .values()
            .filter_map(|years| years.get(&year))
            .map(|acc| match options.concentration_basis {
                ConcentrationBasis::Counts => acc.count as f64,
                ConcentrationBasis::Amounts => acc.amount_thousands,
            })
            .filter(|v| *v > 0.0)
            .collect();
        let year_sum: f64 = values.iter().sum();
        let hhi = if year_sum > 0.0 {
            Some(
                values
                    .iter()
                    .map(|v| {
                        let share = v / year_sum * 100.0;
                        share * share
                    })
                    .sum::<f64>(),
            )
        } else {
            None
        };
        rows.push(ConcentrationRow {
            year,
            hhi,
            category: hhi.map(ConcentrationCategory::from_hhi),
        });
    }
    out.concentration = rows;
}

fn build_trends(out: &mut Aggregates, filters: &FilterSet, year_totals: &BTreeMap<i32, Acc>) {
    let mut rows: Vec<TrendRow> = Vec::new();
    let mut prev: Option<(i64, f64)> = None;
    for &year in &filters.years {
        let acc = year_totals.get(&year).copied().unwrap_or_default();
        let amount = acc.amount_thousands * 1000.0;
        let (count_delta, count_pct_change, amount_delta, amount_pct_change) = match prev {
            // First year has no deltas; zero denominators yield nulls.
            None => (None, None, None, None),
            Some((prev_count, prev_amount)) => (
                Some(acc.count - prev_count),
                (prev_count > 0)
                    .then(|| (acc.count - prev_count) as f64 / prev_count as f64 * 100.0),
                Some(amount - prev_amount),
                (prev_amount > 0.0).then(|| (amount - prev_amount) / prev_amount * 100.0),
            ),
        };
        rows.push(TrendRow {
            year,
            count: acc.count,
            amount,
            count_delta,
            count_pct_change,
            amount_delta,
            amount_pct_change,
            direction: count_pct_change.map(TrendDirection::from_pct_change),
        });
        prev = Some((acc.count, amount));
    }
    out.trends = rows;
}

fn build_peer_comparison(out: &mut Aggregates, filters: &FilterSet, latest_year: i32) {
    let Some(subject_id) = &filters.subject_lender_id else {
        return;
    };
    let band = filters.peer_volume_band.unwrap_or_default();
    let subject = out
        .by_lender_full
        .iter()
        .find(|l| &l.lender_id == subject_id)
        .cloned();

    let Some(subject_row) = subject else {
        out.warnings.push(format!(
            "peer-comparison: subject lender {subject_id} not present in {latest_year} results"
        ));
        out.peer_comparison = Some(PeerComparison {
            subject: None,
            band,
            peer_count: 0,
            peer_mean: None,
        });
        return;
    };

    let low = band.low_multiplier * subject_row.latest_year_count as f64;
    let high = band.high_multiplier * subject_row.latest_year_count as f64;
    let peers: Vec<&LenderRow> = out
        .by_lender_full
        .iter()
        .filter(|l| l.lender_id != subject_row.lender_id)
        .filter(|l| {
            let volume = l.latest_year_count as f64;
            volume >= low && volume <= high
        })
        .collect();

    let peer_mean = if peers.is_empty() {
        out.warnings
            .push("peer-comparison: no peers within the volume band".to_string());
        None
    } else {
        let n = peers.len() as f64;
        let mean_share = |f: fn(&LenderRow) -> (i64, i64)| -> Option<f64> {
            let shares: Vec<f64> = peers
                .iter()
                .filter_map(|p| {
                    let (part, whole) = f(p);
                    percent(part, whole)
                })
                .collect();
            if shares.is_empty() {
                None
            } else {
                Some(shares.iter().sum::<f64>() / shares.len() as f64)
            }
        };
        Some(PeerMeans {
            count: peers.iter().map(|p| p.total.count as f64).sum::<f64>() / n,
            amount: peers.iter().map(|p| p.total.amount).sum::<f64>() / n,
            lmi_borrower_share: mean_share(|p| (p.lmi_borrower.count, p.total.count)),
            lmi_tract_share: mean_share(|p| (p.lmi_tract.count, p.total.count)),
            mmct_share: mean_share(|p| (p.mmct.count, p.total.count)),
        })
    };

    out.peer_comparison = Some(PeerComparison {
        subject: Some(subject_row),
        band,
        peer_count: peers.len(),
        peer_mean,
    });
}
