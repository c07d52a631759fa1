//! Report store: maps job ids to finalized reports, persists the artifact
//! files exporters consume, and streams downloads.
//!
//! The in-process map is the source of truth for reads; `report.json` and
//! `metadata.json` under the artifact directory are the durable layout
//! format writers read. Reports are garbage-collected after a TTL; reads
//! after GC fail with a distinct Expired error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::report::Report;
use crate::recipes::{DownloadFormat, RecipeSpec};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("unknown job")]
    NotFound,

    #[error("report expired")]
    Expired,

    #[error("artifact io: {0}")]
    Io(String),

    #[error("format {0:?} not supported")]
    UnsupportedFormat(DownloadFormat),
}

impl From<StoreError> for crate::error::AppError {
    fn from(e: StoreError) -> Self {
        use crate::error::AppError;
        match e {
            StoreError::NotFound => AppError::UnknownJob("no report for job".into()),
            StoreError::Expired => AppError::ReportExpired("report garbage-collected".into()),
            StoreError::UnsupportedFormat(format) => {
                AppError::UnsupportedFormat(format!("{format:?}").to_lowercase())
            }
            StoreError::Io(message) => AppError::Storage(message),
        }
    }
}

/// Run metadata persisted beside the report for exporters and debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub warnings: Vec<String>,
    pub version: String,
}

/// A download payload: bytes, MIME type, suggested filename.
pub struct Download {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub filename: String,
}

/// Byte producer for one download format. JSON and CSV writers live in the
/// engine; richer formats are external collaborators registered at startup.
pub trait ReportWriter: Send + Sync {
    fn format(&self) -> DownloadFormat;
    fn mime(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn write(&self, report: &Report) -> Result<Vec<u8>, String>;
}

struct Stored {
    /// Dropped by the GC sweep; the entry itself stays as an Expired
    /// tombstone.
    report: Option<Arc<Report>>,
    stored_at: DateTime<Utc>,
}

pub struct ReportStore {
    reports: RwLock<HashMap<Uuid, Stored>>,
    writers: IndexMap<DownloadFormat, Arc<dyn ReportWriter>>,
    artifact_dir: PathBuf,
    ttl: Duration,
}

impl ReportStore {
    pub fn new(artifact_dir: PathBuf, ttl: Duration) -> Self {
        let mut writers: IndexMap<DownloadFormat, Arc<dyn ReportWriter>> = IndexMap::new();
        let json = Arc::new(JsonWriter);
        let csv = Arc::new(CsvWriter);
        writers.insert(json.format(), json as Arc<dyn ReportWriter>);
        writers.insert(csv.format(), csv as Arc<dyn ReportWriter>);
        Self {
            reports: RwLock::new(HashMap::new()),
            writers,
            artifact_dir,
            ttl,
        }
    }

    /// Persist a finished report: write `report.json` and `metadata.json`
    /// under the job's artifact directory, then publish it for reads.
    pub async fn persist(&self, report: Report, run: RunMetadata) -> Result<(), StoreError> {
        let job_id = report.metadata.job_id;
        let dir = self.artifact_dir.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let report_json = serde_json::to_vec_pretty(&report)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::write(dir.join("report.json"), &report_json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let metadata_json = serde_json::to_vec_pretty(&run)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::write(dir.join("metadata.json"), &metadata_json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let mut reports = self.reports.write().await;
        reports.insert(
            job_id,
            Stored {
                report: Some(Arc::new(report)),
                stored_at: Utc::now(),
            },
        );
        tracing::info!(%job_id, "report persisted");
        Ok(())
    }

    /// Persist auxiliary derived tables for exporters under `raw/`.
    pub async fn persist_raw(
        &self,
        job_id: Uuid,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let dir = self.artifact_dir.join(job_id.to_string()).join("raw");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::write(dir.join(format!("{name}.json")), bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Arc<Report>, StoreError> {
        let reports = self.reports.read().await;
        match reports.get(&job_id) {
            None => Err(StoreError::NotFound),
            Some(stored) => match &stored.report {
                Some(report) if !self.is_expired(stored) => Ok(Arc::clone(report)),
                _ => Err(StoreError::Expired),
            },
        }
    }

    /// Produce download bytes for a stored report. The recipe decides
    /// which formats are offered at all; the writer registry decides
    /// which this process can author.
    pub async fn download(
        &self,
        job_id: Uuid,
        format: DownloadFormat,
        recipe: &RecipeSpec,
    ) -> Result<Download, StoreError> {
        if !recipe.supports_format(format) {
            return Err(StoreError::UnsupportedFormat(format));
        }
        let writer = self
            .writers
            .get(&format)
            .ok_or(StoreError::UnsupportedFormat(format))?;
        let report = self.get(job_id).await?;
        let bytes = writer.write(&report).map_err(StoreError::Io)?;
        Ok(Download {
            bytes,
            mime: writer.mime(),
            filename: format!(
                "justdata-{}-{}.{}",
                recipe.kind,
                job_id,
                writer.extension()
            ),
        })
    }

    fn is_expired(&self, stored: &Stored) -> bool {
        let age = Utc::now().signed_duration_since(stored.stored_at);
        age.to_std().map(|d| d > self.ttl).unwrap_or(false)
    }

    /// Drop expired report payloads, leaving tombstones so later reads
    /// fail as Expired rather than NotFound.
    pub async fn gc_sweep(&self) {
        let mut reports = self.reports.write().await;
        let mut evicted = 0usize;
        for stored in reports.values_mut() {
            let expired = {
                let age = Utc::now().signed_duration_since(stored.stored_at);
                age.to_std().map(|d| d > self.ttl).unwrap_or(false)
            };
            if expired && stored.report.take().is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "report store gc sweep");
        }
    }
}

struct JsonWriter;

impl ReportWriter for JsonWriter {
    fn format(&self) -> DownloadFormat {
        DownloadFormat::Json
    }

    fn mime(&self) -> &'static str {
        "application/json"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, report: &Report) -> Result<Vec<u8>, String> {
        serde_json::to_vec_pretty(report).map_err(|e| e.to_string())
    }
}

/// Flat CSV over the summary table; richer spreadsheets are the Excel
/// writer collaborator's job.
struct CsvWriter;

impl ReportWriter for CsvWriter {
    fn format(&self) -> DownloadFormat {
        DownloadFormat::Csv
    }

    fn mime(&self) -> &'static str {
        "text/csv"
    }

    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write(&self, report: &Report) -> Result<Vec<u8>, String> {
        let mut out = String::from(
            "county,year,total_count,total_amount,lmi_tract_count,lmi_borrower_count,mmct_count\n",
        );
        for row in &report.summary {
            out.push_str(&format!(
                "{},{},{},{:.0},{},{},{}\n",
                row.county,
                row.year,
                row.total.count,
                row.total.amount,
                row.lmi_tract.count,
                row.lmi_borrower.count,
                row.mmct.count
            ));
        }
        Ok(out.into_bytes())
    }
}
