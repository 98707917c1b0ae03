use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use kiln_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use crate::handler::{Handler, JobOutput};

/// A queued job as delivered by the serverless runtime.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub id: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub output: JobOutput,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
}

#[derive(Clone)]
struct AppState(Arc<Handler>);

/// Runs one job to completion.
pub async fn run_job(handler: &Handler, job: JobRequest) -> JobResponse {
    let id = job.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("Processing job {id}");
    let output = handler.handle(job.input).await;
    let status = if output.is_success() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    info!("Job {id} finished: {status:?}");
    JobResponse { id, status, output }
}

/// Response for a body that is not a valid job envelope.
fn rejected(err: serde_json::Error) -> JobResponse {
    let err = anyhow::Error::from(Error::MalformedInput(err));
    tracing::error!("Rejected job: {err:#}");
    JobResponse {
        id: uuid::Uuid::new_v4().to_string(),
        status: JobStatus::Failed,
        output: JobOutput::failure(&err),
    }
}

// The body is parsed here rather than by the `Json` extractor so that a bad
// envelope still gets a structured 200 response.
async fn runsync_handler(State(state): State<AppState>, body: Bytes) -> Json<JobResponse> {
    match serde_json::from_slice::<JobRequest>(&body) {
        Ok(job) => Json(run_job(&state.0, job).await),
        Err(err) => Json(rejected(err)),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.0.model_loaded(),
    })
}

pub fn router(handler: Arc<Handler>) -> Router {
    Router::new()
        .route("/runsync", post(runsync_handler))
        .route("/health", get(health_handler))
        .with_state(AppState(handler))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}

pub async fn serve(handler: Arc<Handler>, bind_address: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("Started job API on {}", listener.local_addr()?);
    axum::serve(listener, router(handler).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::handler;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let (handler, _) = handler(false);
        router(Arc::new(handler))
    }

    async fn post_runsync(app: Router, content_type: Option<&str>, body: &str) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("POST").uri("/runsync");
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        let response = app
            .oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn completed_and_failed_jobs() {
        let (handler, _) = handler(false);
        let state = AppState(Arc::new(handler));

        let ok = run_job(
            &state.0,
            JobRequest {
                id: Some("job-1".to_string()),
                input: json!({ "prompt": "a red cube" }),
            },
        )
        .await;
        assert_eq!(ok.id, "job-1");
        assert_eq!(ok.status, JobStatus::Completed);

        let failed = run_job(
            &state.0,
            JobRequest {
                id: None,
                input: json!({ "prompt": "" }),
            },
        )
        .await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(!failed.id.is_empty());
        let body = serde_json::to_value(&failed).unwrap();
        assert_eq!(body["status"], "FAILED");
        assert_eq!(body["output"]["error"], "No prompt provided");

        let Json(health) = health_handler(State(state)).await;
        assert!(health.model_loaded);
    }

    #[tokio::test]
    async fn runsync_round_trip() {
        let body = json!({ "id": "job-7", "input": { "prompt": "a red cube", "seed": 7 } });
        let (status, out) = post_runsync(app(), Some("application/json"), &body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(out["id"], "job-7");
        assert_eq!(out["status"], "COMPLETED");
        assert_eq!(out["output"]["seed"], 7);
        assert_eq!(out["output"]["image_format"], "png");
    }

    #[tokio::test]
    async fn bad_envelopes_get_structured_failures() {
        let cases = [
            (Some("application/json"), "{not json".to_string()),
            (
                Some("application/json"),
                json!({ "id": 5, "input": { "prompt": "x" } }).to_string(),
            ),
            (None, json!({ "input": { "prompt": "x" } }).to_string()),
        ];
        for (content_type, body) in cases {
            let (status, out) = post_runsync(app(), content_type, &body).await;
            assert_eq!(status, StatusCode::OK, "body: {body}");
            if content_type.is_none() {
                // content type is not required
                assert_eq!(out["status"], "COMPLETED");
                continue;
            }
            assert_eq!(out["status"], "FAILED", "body: {body}");
            assert_eq!(out["output"]["error_type"], "validation");
            assert!(out["output"].get("trace").is_some());
            assert!(out["output"].get("image").is_none());
            assert!(!out["id"].as_str().unwrap().is_empty());
        }
    }
}
