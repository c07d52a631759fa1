//! API integration tests
//!
//! These exercise a running server (with a reachable warehouse) end to
//! end. Run with: cargo test -- --ignored

use reqwest::Client;
use serde_json::{json, Value};

const BASE_URL: &str = "http://localhost:8080";

fn mortgage_request() -> Value {
    json!({
        "recipe": "mortgage",
        "filters": {
            "dataDomain": "mortgage",
            "geography": ["05143"],
            "years": [2022],
            "loanPurposes": ["home-purchase"],
            "actionsTaken": ["originated"],
            "occupancy": ["owner"],
            "units": ["1", "2", "3", "4"],
            "constructionMethod": ["site-built"],
            "excludeReverseMortgage": true
        }
    })
}

/// Submit a job and return its id with the response body.
async fn submit(client: &Client, body: &Value) -> (String, Value) {
    let response = client
        .post(format!("{}/analyze", BASE_URL))
        .json(body)
        .send()
        .await
        .expect("Failed to send analyze request");

    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.expect("Failed to parse analyze response");
    let job_id = body["jobId"].as_str().expect("No jobId in response").to_string();
    (job_id, body)
}

/// Poll /status until the job is terminal.
async fn wait_terminal(client: &Client, job_id: &str) -> Value {
    for _ in 0..600 {
        let status: Value = client
            .get(format!("{}/status/{}", BASE_URL, job_id))
            .send()
            .await
            .expect("Failed to poll status")
            .json()
            .await
            .expect("Failed to parse status");
        let state = status["state"].as_str().unwrap_or_default().to_string();
        if state == "succeeded" || state == "failed" || state == "cancelled" {
            return status;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_health_check() {
    let client = Client::new();

    let response = client
        .get(format!("{}/health", BASE_URL))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["ok"], true);
    assert!(body["version"].is_string());
}

#[tokio::test]
#[ignore]
async fn test_analyze_validation_failure() {
    let client = Client::new();

    let response = client
        .post(format!("{}/analyze", BASE_URL))
        .json(&json!({
            "recipe": "mortgage",
            "filters": {
                "dataDomain": "mortgage",
                "geography": [],
                "years": [2022]
            }
        }))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
#[ignore]
async fn test_analyze_to_report() {
    let client = Client::new();
    let (job_id, links) = submit(&client, &mortgage_request()).await;
    assert!(links["progressUrl"].as_str().unwrap().contains(&job_id));

    let status = wait_terminal(&client, &job_id).await;
    assert_eq!(status["state"], "succeeded");

    let report: Value = client
        .get(format!("{}/report-data?job_id={}", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to fetch report")
        .json()
        .await
        .expect("Failed to parse report");

    assert!(report["summary"].is_array());
    assert!(report["byDemographic"].is_array());
    assert!(report["concentration"].is_array());
    assert_eq!(report["metadata"]["jobId"], job_id.as_str());

    // Canonicalized filter echo: years come back sorted.
    let years: Vec<i64> = report["metadata"]["filterSet"]["years"]
        .as_array()
        .unwrap()
        .iter()
        .map(|y| y.as_i64().unwrap())
        .collect();
    let mut sorted = years.clone();
    sorted.sort_unstable();
    assert_eq!(years, sorted);
}

#[tokio::test]
#[ignore]
async fn test_progress_stream_replays_and_terminates() {
    let client = Client::new();
    let (job_id, _) = submit(&client, &mortgage_request()).await;
    wait_terminal(&client, &job_id).await;

    // Subscribing after completion yields the single final event and the
    // stream closes.
    let body = client
        .get(format!("{}/progress/{}", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to open progress stream")
        .text()
        .await
        .expect("Failed to read progress stream");

    assert!(body.contains("\"terminal\":true"));
}

#[tokio::test]
#[ignore]
async fn test_download_json_and_csv() {
    let client = Client::new();
    let (job_id, _) = submit(&client, &mortgage_request()).await;
    wait_terminal(&client, &job_id).await;

    let json_response = client
        .get(format!("{}/download?job_id={}&format=json", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to download json");
    assert!(json_response.status().is_success());
    assert_eq!(
        json_response.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );

    let csv_response = client
        .get(format!("{}/download?job_id={}&format=csv", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to download csv");
    assert!(csv_response.status().is_success());
    let text = csv_response.text().await.unwrap();
    assert!(text.starts_with("county,year"));
}

#[tokio::test]
#[ignore]
async fn test_download_unsupported_format() {
    let client = Client::new();
    let (job_id, _) = submit(&client, &mortgage_request()).await;
    wait_terminal(&client, &job_id).await;

    let response = client
        .get(format!("{}/download?job_id={}&format=doc", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 415);
}

#[tokio::test]
#[ignore]
async fn test_download_before_completion_conflicts() {
    let client = Client::new();
    let (job_id, _) = submit(&client, &mortgage_request()).await;

    let response = client
        .get(format!("{}/download?job_id={}&format=json", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to send request");
    // The job may already have finished on a fast warehouse; accept either.
    assert!(response.status() == 409 || response.status().is_success());
}

#[tokio::test]
#[ignore]
async fn test_unknown_job_is_404() {
    let client = Client::new();
    let response = client
        .get(format!(
            "{}/report-data?job_id=00000000-0000-0000-0000-000000000000",
            BASE_URL
        ))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
#[ignore]
async fn test_cancel_in_flight_job() {
    let client = Client::new();
    // Several counties over three years keeps the warehouse busy long
    // enough to observe the cancellation.
    let (job_id, _) = submit(
        &client,
        &json!({
            "recipe": "mortgage",
            "filters": {
                "dataDomain": "mortgage",
                "geography": ["06037", "06059", "06073"],
                "years": [2020, 2021, 2022]
            }
        }),
    )
    .await;

    let response = client
        .post(format!("{}/cancel/{}", BASE_URL, job_id))
        .send()
        .await
        .expect("Failed to send cancel");
    assert!(response.status().is_success());

    let status = wait_terminal(&client, &job_id).await;
    // Cancelled, unless the job beat the signal to the finish line.
    assert!(status["state"] == "cancelled" || status["state"] == "succeeded");
    if status["state"] == "cancelled" {
        let report = client
            .get(format!("{}/report-data?job_id={}", BASE_URL, job_id))
            .send()
            .await
            .expect("Failed to fetch report");
        assert_eq!(report.status(), 404);
    }
}
