//! Pipeline driver: runs one analysis job end to end.
//!
//! Stage order: build-query → warehouse-execute → aggregate → census-join
//! → narratives → finalize. Warehouse failures are fatal (transient ones
//! retried up to three attempts); census and narrative failures demote to
//! warnings. Cancellation is observed at every stage boundary and inside
//! every long await.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::census::DemographicJoiner;
use crate::engine::aggregate::{aggregate, Aggregates};
use crate::engine::EngineContext;
use crate::error::{AppError, AppResult};
use crate::jobs::channel::ProgressChannel;
use crate::jobs::store::RunMetadata;
use crate::models::geography::Vintage;
use crate::models::report::{DemographicContext, Report, ReportMetadata};
use crate::models::request::AnalysisRequest;
use crate::models::LoanRow;
use crate::narrative;
use crate::query;
use crate::recipes::RecipeSpec;
use crate::warehouse::WarehouseError;

const WAREHOUSE_ATTEMPTS: u32 = 3;

/// Run the pipeline for a validated, canonicalized request. Returns the
/// persisted report on success.
pub async fn run(
    engine: &EngineContext,
    job_id: Uuid,
    request: &AnalysisRequest,
    recipe: &RecipeSpec,
    channel: &ProgressChannel,
    cancel: &mut watch::Receiver<bool>,
) -> AppResult<Report> {
    let started_at = Utc::now();
    let filters = &request.filters;
    let mut warnings: Vec<String> = Vec::new();

    ensure_not_cancelled(cancel)?;
    channel.publish(5, "validate", None);

    channel.publish(10, "build-query", None);
    let built = query::build(filters);
    let query_hash = built.hash();
    tracing::debug!(%job_id, query_hash, "statement built");

    channel.publish(15, "warehouse-execute", None);
    let rows = execute_with_retries(engine, recipe, &built, channel, cancel).await?;
    channel.publish(40, "warehouse-execute", Some(format!("rows: {}", rows.len())));

    ensure_not_cancelled(cancel)?;
    channel.publish(45, "aggregate", None);
    let mut aggregates = aggregate(&rows, filters, &recipe.aggregate);
    warnings.append(&mut aggregates.warnings);
    channel.publish(55, "aggregate", Some(format!("lenders: {}", aggregates.by_lender.total_lenders)));

    channel.publish(60, "census-join", None);
    let context = census_join(engine, recipe, filters, &mut aggregates, channel, cancel, &mut warnings).await?;

    let mut report = assemble_report(
        job_id,
        request,
        recipe,
        query_hash,
        aggregates,
        context,
    );

    // Narratives are attached after all tables are final.
    let section_count = recipe.narrative_sections.len().max(1);
    for (index, &section) in recipe.narrative_sections.iter().enumerate() {
        ensure_not_cancelled(cancel)?;
        let percent = 70 + (20 * index / section_count) as u8;
        channel.publish(percent, &format!("narrative-section:{section}"), None);
        match engine.ai.as_deref() {
            None => {
                warnings.push(format!("narrative section {section}: no provider configured"));
            }
            Some(client) => {
                if let Some(warning) =
                    with_cancel(cancel, narrative::attach_section(&mut report, section, client))
                        .await?
                {
                    warnings.push(warning);
                }
            }
        }
    }

    ensure_not_cancelled(cancel)?;
    channel.publish(95, "finalize", None);
    report.metadata.warnings = warnings.clone();

    let raw_lenders = serde_json::to_value(&report.by_lender)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    engine
        .store
        .persist(
            report.clone(),
            RunMetadata {
                job_id,
                started_at,
                finished_at: Utc::now(),
                warnings,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .await
        .map_err(|e| AppError::Storage(e.to_string()))?;
    // Raw tables are best-effort exporter inputs.
    if let Err(e) = engine.store.persist_raw(job_id, "by_lender", &raw_lenders).await {
        tracing::warn!(%job_id, error = %e, "raw table persist failed");
    }

    Ok(report)
}

fn ensure_not_cancelled(cancel: &watch::Receiver<bool>) -> AppResult<()> {
    if *cancel.borrow() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

/// Race a future against the cancellation signal.
async fn with_cancel<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = T>,
) -> AppResult<T> {
    tokio::select! {
        biased;
        _ = wait_for_cancel(cancel) => Err(AppError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling; nothing to wait for.
            std::future::pending::<()>().await;
        }
    }
}

async fn execute_with_retries(
    engine: &EngineContext,
    recipe: &RecipeSpec,
    built: &query::BuiltQuery,
    channel: &ProgressChannel,
    cancel: &mut watch::Receiver<bool>,
) -> AppResult<Vec<LoanRow>> {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 1u32;
    loop {
        let attempt_result = match recipe.warehouse_timeout_secs {
            // Recipe override tightens (or widens) the warehouse wall clock.
            Some(secs) => {
                match with_cancel(
                    cancel,
                    tokio::time::timeout(
                        Duration::from_secs(secs),
                        engine.warehouse.execute(built),
                    ),
                )
                .await?
                {
                    Ok(result) => result,
                    Err(_) => Err(WarehouseError::Timeout(Duration::from_secs(secs))),
                }
            }
            None => with_cancel(cancel, engine.warehouse.execute(built)).await?,
        };
        match attempt_result {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_transient() && attempt < WAREHOUSE_ATTEMPTS => {
                tracing::warn!(attempt, error = %e, "transient warehouse failure, retrying stage");
                channel.publish(
                    15,
                    "warehouse-execute",
                    Some(format!("retry {attempt}/{WAREHOUSE_ATTEMPTS}")),
                );
                with_cancel(cancel, tokio::time::sleep(backoff)).await?;
                backoff *= 2;
                attempt += 1;
            }
            Err(e @ WarehouseError::Timeout(_)) => {
                tracing::error!(error = %e, "warehouse timed out");
                return Err(AppError::Timeout);
            }
            Err(e) => return Err(AppError::Warehouse(e)),
        }
    }
}

/// Census stage: demographic context plus the tract-level join. Every
/// failure path degrades to a warning.
async fn census_join(
    engine: &EngineContext,
    recipe: &RecipeSpec,
    filters: &crate::models::request::FilterSet,
    aggregates: &mut Aggregates,
    channel: &ProgressChannel,
    cancel: &mut watch::Receiver<bool>,
    warnings: &mut Vec<String>,
) -> AppResult<DemographicContext> {
    let joiner = DemographicJoiner::new(engine.census.as_ref());
    let vintage_timeout = Duration::from_secs(engine.config.census.vintage_timeout_secs);
    let stage_timeout = vintage_timeout * recipe.census_vintages.len().max(1) as u32;

    let context = match with_cancel(
        cancel,
        tokio::time::timeout(
            stage_timeout,
            joiner.build_context(&filters.geography, recipe.census_vintages),
        ),
    )
    .await?
    {
        Ok(Ok(context)) => {
            channel.publish(
                65,
                "census-join",
                Some(format!("vintages: {}", context.vintages.len())),
            );
            context
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "census unavailable, proceeding without context");
            warnings.push(format!("census-unavailable: {e}"));
            DemographicContext::default()
        }
        Err(_) => {
            warnings.push("census-unavailable: stage timeout".to_string());
            DemographicContext::default()
        }
    };

    if !context.is_empty() {
        DemographicJoiner::join_population_shares(
            &context,
            latest_vintage(recipe),
            &mut aggregates.by_demographic,
        );

        match with_cancel(
            cancel,
            tokio::time::timeout(
                vintage_timeout,
                joiner.join_tracts(
                    &filters.geography,
                    latest_vintage(recipe),
                    &aggregates.tract_rollup,
                    &mut aggregates.by_income_neighborhood,
                ),
            ),
        )
        .await?
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warnings.push(format!("census-tracts-unavailable: {e}"));
            }
            Err(_) => {
                warnings.push("census-tracts-unavailable: stage timeout".to_string());
            }
        }
    }

    channel.publish(70, "census-join", None);
    Ok(context)
}

fn latest_vintage(recipe: &RecipeSpec) -> Vintage {
    recipe
        .census_vintages
        .iter()
        .copied()
        .max()
        .unwrap_or(Vintage::AcsLatest)
}

fn assemble_report(
    job_id: Uuid,
    request: &AnalysisRequest,
    recipe: &RecipeSpec,
    query_hash: String,
    aggregates: Aggregates,
    context: DemographicContext,
) -> Report {
    Report {
        metadata: ReportMetadata {
            job_id,
            data_domain: request.filters.data_domain,
            recipe: recipe.kind,
            filter_set: request.filters.clone(),
            census_vintages: recipe.census_vintages.to_vec(),
            query_hash,
            denominator: recipe.aggregate.denominator,
            concentration_basis: recipe.aggregate.concentration_basis,
            created_at: Utc::now(),
            warnings: Vec::new(),
        },
        summary: aggregates.summary,
        by_demographic: aggregates.by_demographic,
        by_income_neighborhood: aggregates.by_income_neighborhood,
        by_lender: aggregates.by_lender,
        by_lender_by_year: aggregates.by_lender_by_year,
        concentration: aggregates.concentration,
        trends: aggregates.trends,
        demographic_context: context,
        peer_comparison: aggregates.peer_comparison,
        narratives: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::census::{CensusError, MockCensusSource};
    use crate::config::AppConfig;
    use crate::jobs::store::ReportStore;
    use crate::models::classification::RaceEthnicity;
    use crate::models::geography::CountyCode;
    use crate::models::request::{DataDomain, FilterSet, RecipeKind};
    use crate::warehouse::{MockWarehouse, Warehouse, WarehouseError};

    fn request() -> AnalysisRequest {
        let mut request = AnalysisRequest {
            recipe: RecipeKind::Mortgage,
            filters: FilterSet {
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
            },
        };
        request.prepare().unwrap();
        request
    }

    fn sample_rows() -> Vec<LoanRow> {
        (0..20)
            .map(|i| {
                let mut row = LoanRow::new(
                    2022,
                    if i % 2 == 0 { "L1" } else { "L2" },
                    CountyCode::parse("05143").unwrap(),
                    &format!("k{i}"),
                );
                row.amount = Some(150.0);
                row.race_ethnicity = if i % 5 == 0 {
                    RaceEthnicity::Hispanic
                } else {
                    RaceEthnicity::White
                };
                row
            })
            .collect()
    }

    fn engine_with(
        warehouse: Arc<dyn Warehouse>,
        census: MockCensusSource,
    ) -> EngineContext {
        let config = Arc::new(AppConfig::for_tests());
        let store = Arc::new(ReportStore::new(
            config.artifacts.dir.clone().into(),
            Duration::from_secs(3600),
        ));
        EngineContext {
            config,
            warehouse,
            census: Arc::new(census),
            ai: None,
            store,
        }
    }

    fn census_outage() -> MockCensusSource {
        let mut census = MockCensusSource::new();
        census
            .expect_county_demographics()
            .returning(|_, _| Err(CensusError::Status(503)));
        census
            .expect_tract_distributions()
            .returning(|_, _| Err(CensusError::Status(503)));
        census
    }

    /// A warehouse stage that never completes, for cancellation tests.
    struct HangingWarehouse;

    #[async_trait]
    impl Warehouse for HangingWarehouse {
        async fn execute(
            &self,
            _query: &crate::query::BuiltQuery,
        ) -> Result<Vec<LoanRow>, WarehouseError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn census_outage_succeeds_with_warning() {
        // Scenario S5: census 503s on every retry; the job still succeeds.
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().returning(|_| Ok(sample_rows()));

        let engine = engine_with(Arc::new(warehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let channel = ProgressChannel::new();
        let (_tx, mut cancel) = watch::channel(false);

        let report = run(&engine, Uuid::new_v4(), &request, &recipe, &channel, &mut cancel)
            .await
            .unwrap();

        assert!(report.demographic_context.is_empty());
        assert!(report
            .metadata
            .warnings
            .iter()
            .any(|w| w.starts_with("census-unavailable")));
        assert_eq!(report.summary[0].total.count, 20);
        // Narratives degraded too (no provider configured).
        assert!(report.narratives.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_warehouse_execution() {
        // Scenario S4: cancel while the warehouse hangs.
        let engine = engine_with(Arc::new(HangingWarehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let channel = ProgressChannel::new();
        let (tx, mut cancel) = watch::channel(false);

        let handle = {
            let job_id = Uuid::new_v4();
            async move { run(&engine, job_id, &request, &recipe, &channel, &mut cancel).await }
        };
        let result = tokio::join!(handle, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        })
        .0;

        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_warehouse_errors_retry_then_fail() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_execute()
            .times(3)
            .returning(|_| Err(WarehouseError::Transient("connection reset".into())));

        let engine = engine_with(Arc::new(warehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let channel = ProgressChannel::new();
        let (_tx, mut cancel) = watch::channel(false);

        let result = run(&engine, Uuid::new_v4(), &request, &recipe, &channel, &mut cancel).await;
        assert!(matches!(result, Err(AppError::Warehouse(_))));
    }

    #[tokio::test]
    async fn warehouse_timeout_maps_to_timeout_failure() {
        let mut warehouse = MockWarehouse::new();
        warehouse
            .expect_execute()
            .returning(|_| Err(WarehouseError::Timeout(Duration::from_secs(600))));

        let engine = engine_with(Arc::new(warehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let channel = ProgressChannel::new();
        let (_tx, mut cancel) = watch::channel(false);

        let result = run(&engine, Uuid::new_v4(), &request, &recipe, &channel, &mut cancel).await;
        assert!(matches!(result, Err(AppError::Timeout)));
    }

    #[tokio::test]
    async fn progress_percent_is_monotonic_through_the_run() {
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().returning(|_| Ok(sample_rows()));

        let engine = engine_with(Arc::new(warehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let channel = ProgressChannel::new();
        let (_tx, mut cancel) = watch::channel(false);

        run(&engine, Uuid::new_v4(), &request, &recipe, &channel, &mut cancel)
            .await
            .unwrap();

        let (events, _) = channel.subscribe(None);
        let mut last = 0u8;
        for event in &events {
            assert!(event.percent >= last, "percent regressed at {}", event.status);
            last = event.percent;
        }
        assert!(events.iter().any(|e| e.status == "finalize"));
    }

    #[tokio::test]
    async fn resubmission_yields_equal_tables() {
        let mut warehouse = MockWarehouse::new();
        warehouse.expect_execute().returning(|_| Ok(sample_rows()));
        let engine = engine_with(Arc::new(warehouse), census_outage());
        let request = request();
        let recipe = RecipeSpec::for_kind(request.recipe);
        let (_tx, mut cancel) = watch::channel(false);

        let a = run(&engine, Uuid::new_v4(), &request, &recipe, &ProgressChannel::new(), &mut cancel)
            .await
            .unwrap();
        let b = run(&engine, Uuid::new_v4(), &request, &recipe, &ProgressChannel::new(), &mut cancel)
            .await
            .unwrap();

        assert_eq!(a.summary, b.summary);
        assert_eq!(a.by_demographic, b.by_demographic);
        assert_eq!(a.by_lender, b.by_lender);
        assert_eq!(a.concentration, b.concentration);
        assert_eq!(a.metadata.query_hash, b.metadata.query_hash);
    }
}
