//! HTTP surface tests over a real socket.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sandbox_executor::config::ServerConfig;
use sandbox_executor::http_server::{self, CancelInfo, HealthInfo, JobInfo, RunResponse};
use sandbox_executor::orchestrator::Orchestrator;
use sandbox_executor::runtime::LocalRuntime;
use sandbox_executor::state::AppState;

struct Harness {
    base: String,
    http: reqwest::Client,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(max_concurrent: usize, queue_depth: usize) -> Self {
        let config = ServerConfig {
            max_concurrent,
            queue_depth,
            provisioning_deadline: Duration::from_secs(3),
            cancel_grace: Duration::from_millis(500),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(Arc::new(LocalRuntime::default()), config).unwrap();
        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(http_server::serve(
            listener,
            AppState::new(orchestrator),
            shutdown.clone(),
        ));
        Self {
            base,
            http: reqwest::Client::new(),
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn health_reports_budget() {
    let h = Harness::start(3, 1).await;
    let health: HealthInfo = h
        .http
        .get(h.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.runtime, "local");
    assert_eq!(health.capacity, 3);
    assert_eq!(health.running, 0);
}

#[tokio::test]
async fn run_collects_output_and_terminal() {
    let h = Harness::start(2, 0).await;
    let response = h
        .http
        .post(h.url("/run"))
        .json(&json!({
            "command": "sh",
            "args": ["greet.sh", "world"],
            "files": [{"path": "greet.sh", "content": BASE64.encode("echo hello $1; echo warn >&2")}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let run: RunResponse = response.json().await.unwrap();
    assert_eq!(run.stdout, "hello world\n");
    assert_eq!(run.stderr, "warn\n");
    let terminal = run.terminal.unwrap();
    assert_eq!(terminal.reason, "exited");
    assert_eq!(terminal.exit_code, Some(0));

    let job: JobInfo = h
        .http
        .get(h.url(&format!("/jobs/{}", run.job_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job.state, "torn_down");
    assert!(job.container_id.is_some());

    let cancel: CancelInfo = h
        .http
        .post(h.url(&format!("/jobs/{}/cancel", run.job_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(cancel.already_terminated);
}

#[tokio::test]
async fn run_with_timeout_reports_timeout() {
    let h = Harness::start(1, 0).await;
    let run: RunResponse = h
        .http
        .post(h.url("/run"))
        .json(&json!({"command": "sleep", "args": ["30"], "limits": {"timeout_ms": 300}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(run.terminal.unwrap().reason, "timeout");
}

#[tokio::test]
async fn missing_command_is_bad_request() {
    let h = Harness::start(1, 0).await;
    let response = h
        .http
        .post(h.url("/run"))
        .json(&json!({"command": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = Harness::start(1, 0).await;
    let response = h.http.get(h.url("/jobs/nope")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = h.http.post(h.url("/jobs/nope/cancel")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn saturated_server_answers_service_unavailable() {
    let h = Harness::start(1, 0).await;
    let busy = {
        let http = h.http.clone();
        let url = h.url("/run");
        tokio::spawn(async move {
            http.post(url)
                .json(&json!({"command": "sleep", "args": ["2"]}))
                .send()
                .await
                .unwrap()
                .status()
        })
    };

    // Wait until the first job holds the only slot.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let jobs: Vec<JobInfo> = h.http.get(h.url("/jobs")).send().await.unwrap().json().await.unwrap();
            if !jobs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let response = h
        .http
        .post(h.url("/run"))
        .json(&json!({"command": "true"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(busy.await.unwrap(), StatusCode::OK);
}
