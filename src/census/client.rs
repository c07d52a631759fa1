//! HTTP client for the external census service.
//!
//! Requests are coalesced per state and vintage, gated by an in-flight
//! semaphore and a token-bucket rate limit, and retried on 429 and
//! idempotent 5xx with exponential backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use super::{CensusError, CensusSource, DemographicsRow, TractRow};
use crate::config::CensusConfig;
use crate::models::geography::{CountyCode, Vintage};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const MAX_ATTEMPTS: u32 = 5;

/// Dataset path and variable list per vintage (county level).
fn county_dataset(vintage: Vintage) -> (&'static str, &'static [&'static str]) {
    match vintage {
        // total, hispanic, then non-hispanic race populations
        Vintage::Decennial2010 => (
            "2010/dec/sf1",
            &[
                "P003001", "P004003", "P005005", "P005006", "P005004", "P005007", "P005003",
                "P005008", "P005009",
            ],
        ),
        Vintage::Decennial2020 => (
            "2020/dec/dhc",
            &[
                "P5_001N", "P5_010N", "P5_005N", "P5_006N", "P5_004N", "P5_007N", "P5_003N",
                "P5_008N", "P5_009N",
            ],
        ),
        Vintage::AcsLatest => (
            "2022/acs/acs5",
            &[
                "B03002_001E", "B03002_012E", "B03002_005E", "B03002_006E", "B03002_004E",
                "B03002_007E", "B03002_003E", "B03002_008E", "B03002_009E",
            ],
        ),
    }
}

/// Tract-level variables: households, median income, population, white
/// non-Hispanic (minority percent is derived).
fn tract_dataset(vintage: Vintage) -> (&'static str, &'static [&'static str]) {
    match vintage {
        Vintage::Decennial2010 => ("2010/dec/sf1", &["H013001", "P003001", "P005003"]),
        Vintage::Decennial2020 => ("2020/dec/dhc", &["H9_001N", "P5_001N", "P5_003N"]),
        Vintage::AcsLatest => (
            "2022/acs/acs5",
            &["B11001_001E", "B19013_001E", "B03002_001E", "B03002_003E"],
        ),
    }
}

/// Token bucket limiting request rate towards the census service.
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    fn new(rate_per_sec: f64) -> Self {
        let capacity = rate_per_sec.max(1.0);
        Self {
            capacity,
            refill_per_sec: rate_per_sec.max(0.1),
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (ref mut tokens, ref mut last) = *state;
                let now = Instant::now();
                *tokens =
                    (*tokens + now.duration_since(*last).as_secs_f64() * self.refill_per_sec)
                        .min(self.capacity);
                *last = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - *tokens) / self.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Production census client.
pub struct CensusClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    gate: Arc<Semaphore>,
    bucket: TokenBucket,
}

impl CensusClient {
    pub fn new(config: &CensusConfig) -> Result<Self, CensusError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CensusError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            gate: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            bucket: TokenBucket::new(config.requests_per_second),
        })
    }

    /// Dedup county codes and group them per state FIPS, preserving order.
    fn group_by_state(counties: &[CountyCode]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for county in counties {
            let entry = groups.entry(county.state_fips().to_string()).or_default();
            let suffix = county.as_str()[2..].to_string();
            if !entry.contains(&suffix) {
                entry.push(suffix);
            }
        }
        groups
    }

    /// One rate-limited, retried GET returning the census row-array shape
    /// (first row is the header).
    async fn fetch_rows(&self, url: &str) -> Result<Vec<Vec<Option<String>>>, CensusError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CensusError::Transport("census gate closed".into()))?;

        let mut backoff = BACKOFF_BASE;
        let mut last_err = CensusError::RateLimited;
        for attempt in 1..=MAX_ATTEMPTS {
            self.bucket.acquire().await;
            match self.http.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Vec<Vec<Option<String>>>>()
                            .await
                            .map_err(|e| CensusError::Parse(e.to_string()));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "census request retryable failure");
                        last_err = if status.as_u16() == 429 {
                            CensusError::RateLimited
                        } else {
                            CensusError::Status(status.as_u16())
                        };
                    } else {
                        return Err(CensusError::Status(status.as_u16()));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "census transport failure");
                    last_err = CensusError::Transport(e.to_string());
                }
            }
            if attempt < MAX_ATTEMPTS {
                let jitter = rand::thread_rng().gen_range(0..100);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
        Err(last_err)
    }

    fn build_url(&self, dataset: &str, vars: &[&str], geo_for: &str, geo_in: &str) -> String {
        let mut url = format!(
            "{}/data/{}?get={}&for={}&in={}",
            self.base_url,
            dataset,
            vars.join(","),
            geo_for,
            geo_in
        );
        if let Some(key) = &self.api_key {
            url.push_str("&key=");
            url.push_str(key);
        }
        url
    }
}

fn cell_i64(cell: Option<&String>) -> i64 {
    cell.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0)
}

fn cell_f64(cell: Option<&String>) -> Option<f64> {
    // ACS uses large negative sentinels for suppressed values.
    cell.and_then(|v| v.parse::<f64>().ok()).filter(|v| *v >= 0.0)
}

#[async_trait]
impl CensusSource for CensusClient {
    async fn county_demographics(
        &self,
        counties: &[CountyCode],
        vintage: Vintage,
    ) -> Result<Vec<DemographicsRow>, CensusError> {
        if self.api_key.is_none() {
            return Err(CensusError::MissingKey);
        }
        let (dataset, vars) = county_dataset(vintage);
        let mut out = Vec::new();

        for (state, county_fips) in Self::group_by_state(counties) {
            let url = self.build_url(
                dataset,
                vars,
                &format!("county:{}", county_fips.join(",")),
                &format!("state:{state}"),
            );
            let rows = self.fetch_rows(&url).await?;
            // Skip the header row; trailing columns are state and county.
            for row in rows.iter().skip(1) {
                let n = row.len();
                if n < vars.len() + 2 {
                    return Err(CensusError::Parse("short census row".into()));
                }
                let state_col = row[n - 2].as_deref().unwrap_or_default();
                let county_col = row[n - 1].as_deref().unwrap_or_default();
                let county = CountyCode::parse(&format!("{state_col}{county_col}"))
                    .map_err(|e| CensusError::Parse(e.to_string()))?;
                let get = |i: usize| cell_i64(row[i].as_ref());
                out.push(DemographicsRow {
                    county,
                    total_population: get(0),
                    hispanic: get(1),
                    native_american: get(2),
                    asian: get(3),
                    black: get(4),
                    hawaiian_pacific_islander: get(5),
                    white: get(6),
                    other: get(7),
                    two_or_more: get(8),
                });
            }
        }
        tracing::debug!(vintage = %vintage, rows = out.len(), "county demographics fetched");
        Ok(out)
    }

    async fn tract_distributions(
        &self,
        counties: &[CountyCode],
        vintage: Vintage,
    ) -> Result<Vec<TractRow>, CensusError> {
        if self.api_key.is_none() {
            return Err(CensusError::MissingKey);
        }
        let (dataset, vars) = tract_dataset(vintage);
        let has_income = vars.len() == 4;
        let mut out = Vec::new();

        for (state, county_fips) in Self::group_by_state(counties) {
            for county in county_fips {
                let url = self.build_url(
                    dataset,
                    vars,
                    "tract:*",
                    &format!("state:{state}+county:{county}"),
                );
                let rows = self.fetch_rows(&url).await?;
                for row in rows.iter().skip(1) {
                    let n = row.len();
                    if n < vars.len() + 3 {
                        return Err(CensusError::Parse("short census row".into()));
                    }
                    let state_col = row[n - 3].as_deref().unwrap_or_default();
                    let county_col = row[n - 2].as_deref().unwrap_or_default();
                    let tract_col = row[n - 1].as_deref().unwrap_or_default();
                    let tract_id = format!("{state_col}{county_col}{tract_col}");

                    let households = cell_i64(row[0].as_ref());
                    let (median_income, pop_idx) = if has_income {
                        (cell_f64(row[1].as_ref()), 2)
                    } else {
                        (None, 1)
                    };
                    let total = cell_i64(row[pop_idx].as_ref());
                    let white = cell_i64(row[pop_idx + 1].as_ref());
                    let minority_percent = if total > 0 {
                        Some(((total - white) as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
                    } else {
                        None
                    };

                    out.push(TractRow {
                        tract_id,
                        households,
                        median_income,
                        minority_percent,
                    });
                }
            }
        }
        tracing::debug!(vintage = %vintage, tracts = out.len(), "tract distributions fetched");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counties_group_per_state_and_dedup() {
        let counties = vec![
            CountyCode::parse("06037").unwrap(),
            CountyCode::parse("06059").unwrap(),
            CountyCode::parse("06037").unwrap(),
            CountyCode::parse("48201").unwrap(),
        ];
        let groups = CensusClient::group_by_state(&counties);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["06"], vec!["037", "059"]);
        assert_eq!(groups["48"], vec!["201"]);
    }

    #[tokio::test]
    async fn token_bucket_spends_down() {
        tokio::time::pause();
        let bucket = TokenBucket::new(2.0);
        // Capacity 2: two immediate acquisitions, the third waits.
        bucket.acquire().await;
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn suppressed_acs_values_parse_as_none() {
        assert_eq!(cell_f64(Some(&"-666666666".to_string())), None);
        assert_eq!(cell_f64(Some(&"64500".to_string())), Some(64500.0));
        assert_eq!(cell_f64(None), None);
    }
}
