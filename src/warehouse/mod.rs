//! Warehouse client: thin wrapper over the analytics warehouse.
//!
//! The warehouse speaks the Postgres wire protocol; a statement built by the
//! query layer is bound and executed here, and rows are decoded through the
//! projection into `LoanRow`s. No retries at this layer (stage retry is an
//! orchestrator concern).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::models::classification::{IncomeLevel, RaceEthnicity};
use crate::models::geography::CountyCode;
use crate::models::LoanRow;
use crate::query::{BuiltQuery, QueryParam};

/// Warehouse failure modes. Only `Transient` is retryable; everything else
/// terminates the job.
#[derive(Error, Debug, Clone)]
pub enum WarehouseError {
    #[error("transient connection failure: {0}")]
    Transient(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("permission or quota: {0}")]
    Permission(String),

    #[error("query exceeded {0:?} wall clock")]
    Timeout(Duration),

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl WarehouseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WarehouseError::Transient(_))
    }
}

/// The single warehouse operation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a built statement and decode the full result set. May
    /// suspend arbitrarily long while the warehouse computes, bounded by
    /// the configured wall clock.
    async fn execute(&self, query: &BuiltQuery) -> Result<Vec<LoanRow>, WarehouseError>;
}

/// Production warehouse over a Postgres connection pool, gated by a
/// process-wide concurrency semaphore.
pub struct PgWarehouse {
    pool: PgPool,
    gate: Arc<Semaphore>,
    query_timeout: Duration,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, max_concurrent: usize, query_timeout: Duration) -> Self {
        Self {
            pool,
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
            query_timeout,
        }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn execute(&self, query: &BuiltQuery) -> Result<Vec<LoanRow>, WarehouseError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WarehouseError::Transient("warehouse gate closed".into()))?;

        tracing::debug!(params = query.params.len(), "executing warehouse statement");

        let mut statement = sqlx::query(&query.sql);
        for param in &query.params {
            statement = match param {
                QueryParam::Str(v) => statement.bind(v.clone()),
                QueryParam::Int(v) => statement.bind(*v),
                QueryParam::Float(v) => statement.bind(*v),
                QueryParam::Bool(v) => statement.bind(*v),
                QueryParam::StrArray(v) => statement.bind(v.clone()),
                QueryParam::IntArray(v) => statement.bind(v.clone()),
                QueryParam::SmallIntArray(v) => statement.bind(v.clone()),
            };
        }

        let rows = tokio::time::timeout(self.query_timeout, statement.fetch_all(&self.pool))
            .await
            .map_err(|_| WarehouseError::Timeout(self.query_timeout))?
            .map_err(classify_sqlx_error)?;

        tracing::info!(rows = rows.len(), "warehouse statement returned");

        rows.iter().map(decode_row).collect()
    }
}

/// Map driver errors into the warehouse failure taxonomy.
fn classify_sqlx_error(err: sqlx::Error) -> WarehouseError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            WarehouseError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) => {
            // 42501 insufficient_privilege, 53xxx resource exhaustion.
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code == "42501" || code.starts_with("53") {
                WarehouseError::Permission(err.to_string())
            } else {
                WarehouseError::Query(err.to_string())
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            WarehouseError::Decode(err.to_string())
        }
        _ => WarehouseError::Transient(err.to_string()),
    }
}

/// Decode one projected row into a `LoanRow`.
fn decode_row(row: &PgRow) -> Result<LoanRow, WarehouseError> {
    let decode = |e: sqlx::Error| WarehouseError::Decode(e.to_string());

    let county_raw: String = row.try_get("county_code").map_err(decode)?;
    let county = CountyCode::parse(&county_raw)
        .map_err(|e| WarehouseError::Decode(format!("county_code: {e}")))?;

    let race_label: Option<String> = row.try_get("race_ethnicity").map_err(decode)?;
    let borrower_level: Option<String> = row.try_get("borrower_income_level").map_err(decode)?;
    let tract_level: Option<String> = row.try_get("tract_income_level").map_err(decode)?;

    Ok(LoanRow {
        year: row.try_get("year").map_err(decode)?,
        lender_id: row.try_get("lender_id").map_err(decode)?,
        lender_name: row.try_get("lender_name").map_err(decode)?,
        county,
        tract_id: row.try_get("tract_id").map_err(decode)?,
        amount: row.try_get("amount").map_err(decode)?,
        race_ethnicity: race_label
            .as_deref()
            .map(RaceEthnicity::from_label)
            .unwrap_or(RaceEthnicity::NoData),
        borrower_income_level: borrower_level.as_deref().and_then(IncomeLevel::from_label),
        tract_income_level: tract_level.as_deref().and_then(IncomeLevel::from_label),
        is_mmct: row.try_get("is_mmct").map_err(decode)?,
        tract_minority_percent: row.try_get("tract_minority_percent").map_err(decode)?,
        dedup_key: row.try_get("dedup_key").map_err(decode)?,
    })
}

/// Resolve the warehouse connection string: explicit override, then the
/// configured value, then the ambient environment. Resolved once per
/// process at startup; absence is fatal there.
pub fn resolve_warehouse_url(
    override_url: Option<&str>,
    config_url: Option<&str>,
) -> Option<String> {
    if let Some(url) = override_url.filter(|u| !u.is_empty()) {
        return Some(url.to_string());
    }
    if let Some(url) = config_url.filter(|u| !u.is_empty()) {
        return Some(url.to_string());
    }
    std::env::var("JUSTDATA_WAREHOUSE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
        .filter(|u| !u.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_config() {
        let url = resolve_warehouse_url(Some("postgres://a"), Some("postgres://b"));
        assert_eq!(url.as_deref(), Some("postgres://a"));
    }

    #[test]
    fn config_wins_over_environment() {
        let url = resolve_warehouse_url(None, Some("postgres://b"));
        assert_eq!(url.as_deref(), Some("postgres://b"));
    }

    #[test]
    fn blank_values_are_skipped() {
        let url = resolve_warehouse_url(Some(""), Some("postgres://b"));
        assert_eq!(url.as_deref(), Some("postgres://b"));
    }

    #[test]
    fn transient_classification() {
        assert!(WarehouseError::Transient("io".into()).is_transient());
        assert!(!WarehouseError::Query("syntax".into()).is_transient());
        assert!(!WarehouseError::Timeout(Duration::from_secs(600)).is_transient());
    }
}
