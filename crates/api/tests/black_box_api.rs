use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use docflow_api::app::{build_app, services::AppServices};
use docflow_auth::{Hs256OwnerResolver, JwtClaims};
use docflow_core::RetryPolicy;
use docflow_infra::extraction::{ExtractedResult, ExtractionError, FnEngine, PermanentReason};
use docflow_infra::workers::{WorkerPoolConfig, WorkerPoolHandle};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    workers: Option<WorkerPoolHandle>,
}

impl TestServer {
    async fn spawn(max_document_bytes: usize) -> Self {
        let engine = Arc::new(FnEngine::new(|input: &[u8]| match input {
            b"doc-42" => Ok(ExtractedResult::new("summary text")),
            b"%PDF-broken" => Err(ExtractionError::permanent(PermanentReason::MalformedInput, "truncated pdf")),
            other => Ok(ExtractedResult::new(format!("{} bytes", other.len()))),
        }));
        let config = WorkerPoolConfig::default()
            .with_workers(2)
            .with_retry(RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5)))
            .with_requeue_delay(Duration::from_millis(10));
        let services = AppServices::in_memory(engine, config);
        let workers = services.pool.clone().spawn(services.pool_config.clone());

        // Same router as prod, bound to an ephemeral port.
        let resolver = Arc::new(Hs256OwnerResolver::new(SECRET.as_bytes()));
        let app = build_app(services.jobs.clone(), resolver, max_document_bytes);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            workers: Some(workers),
        }
    }

    async fn stop(mut self) {
        if let Some(workers) = self.workers.take() {
            workers.shutdown(Duration::from_secs(1)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(sub: &str, ttl: ChronoDuration) -> String {
    let now = Utc::now();
    let claims = JwtClaims::new(sub, now, now + ttl);

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn token(sub: &str) -> String {
    mint_jwt(sub, ChronoDuration::minutes(10))
}

async fn submit(client: &reqwest::Client, base_url: &str, token: &str, body: &'static [u8]) -> reqwest::Response {
    client
        .post(format!("{}/jobs", base_url))
        .bearer_auth(token)
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn wait_for_terminal(client: &reqwest::Client, base_url: &str, token: &str, id: &str) -> serde_json::Value {
    // Processing is asynchronous; poll until the job settles.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if matches!(body["status"].as_str(), Some("succeeded" | "failed" | "dead_lettered")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not finish within timeout");
}

#[tokio::test]
async fn auth_required_for_job_endpoints() {
    let srv = TestServer::spawn(1024).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .body("doc-42")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let expired = mint_jwt("alice", ChronoDuration::minutes(-5));
    let res = submit(&client, &srv.base_url, &expired, b"doc-42").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    srv.stop().await;
}

#[tokio::test]
async fn submitted_document_is_processed() {
    let srv = TestServer::spawn(1024).await;
    let client = reqwest::Client::new();
    let token = token("alice");

    let res = submit(&client, &srv.base_url, &token, b"doc-42").await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    let id = body["id"].as_str().unwrap().to_string();

    let job = wait_for_terminal(&client, &srv.base_url, &token, &id).await;
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["attempt_count"], 1);
    assert_eq!(job["output_ref"], format!("jobs/{id}/output"));
    assert!(job.get("error").is_none());

    srv.stop().await;
}

#[tokio::test]
async fn permanent_failure_is_visible_in_status() {
    let srv = TestServer::spawn(1024).await;
    let client = reqwest::Client::new();
    let token = token("alice");

    let res = submit(&client, &srv.base_url, &token, b"%PDF-broken").await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let id = res.json::<serde_json::Value>().await.unwrap()["id"].as_str().unwrap().to_string();

    let job = wait_for_terminal(&client, &srv.base_url, &token, &id).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["attempt_count"], 1);
    assert_eq!(job["error"]["kind"], "malformed_input");
    assert!(job.get("output_ref").is_none());

    srv.stop().await;
}

#[tokio::test]
async fn jobs_are_private_to_their_owner() {
    let srv = TestServer::spawn(1024).await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv.base_url, &token("alice"), b"doc-42").await;
    let id = res.json::<serde_json::Value>().await.unwrap()["id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, id))
        .bearer_auth(token("mallory"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    srv.stop().await;
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let srv = TestServer::spawn(16).await;
    let client = reqwest::Client::new();
    let token = token("alice");

    let res = submit(&client, &srv.base_url, &token, b"").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "empty_document");

    let res = submit(&client, &srv.base_url, &token, b"a document well over sixteen bytes").await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, docflow_core::JobId::new()))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    srv.stop().await;
}

#[tokio::test]
async fn health_reports_job_counts() {
    let srv = TestServer::spawn(1024).await;
    let client = reqwest::Client::new();
    let token = token("alice");

    let res = submit(&client, &srv.base_url, &token, b"doc-42").await;
    let id = res.json::<serde_json::Value>().await.unwrap()["id"].as_str().unwrap().to_string();
    wait_for_terminal(&client, &srv.base_url, &token, &id).await;

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["jobs"]["succeeded"], 1);
    assert_eq!(body["jobs"]["queued"], 0);

    srv.stop().await;
}
