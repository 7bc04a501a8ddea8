// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API for submitting, polling and completing executions.
//!
//! | Method | Path                | Handler                     |
//! |--------|---------------------|-----------------------------|
//! | POST   | `/executions`       | [`Orchestrator::start_execution`] |
//! | GET    | `/executions`       | [`Orchestrator::poll_all`]  |
//! | GET    | `/executions/{id}`  | [`Orchestrator::poll`]      |
//! | POST   | `/webhook/complete` | [`Orchestrator::report_job`] |
//! | GET    | `/health`           | database health check       |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::Error;
use crate::executor::JobReport;
use crate::orchestrator::{CallUpdate, Orchestrator, PollReport};

/// Build the API router around an orchestrator.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/executions", post(create_execution).get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/webhook/complete", post(complete_webhook))
        .route("/health", get(health))
        .with_state(orchestrator)
}

/// Submission body for `POST /executions`.
#[derive(Debug, Deserialize)]
pub struct CreateExecutionRequest {
    /// Workflow program handed to the continuation engine.
    pub code: String,
    /// Qualified identifiers or short names of the functions the program may call.
    #[serde(default)]
    pub external_functions: Vec<String>,
    /// Variables bound before the program starts.
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// Response of `POST /executions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateExecutionResponse {
    /// Id of the scheduled execution.
    pub execution_id: String,
}

/// Response of `POST /webhook/complete`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Always `ok` when the job was located.
    pub status: String,
    /// Execution owning the call.
    pub execution_id: String,
    /// Engine-assigned call id.
    pub call_id: i64,
    /// Whether the outcome was recorded or the call had already resolved.
    pub applied: bool,
}

/// Response of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: String,
    /// Whether the database answered.
    pub database: bool,
    /// Crate version.
    pub version: String,
}

/// Error body: `{error, code}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Stable machine-readable code.
    pub code: String,
}

/// Wrapper mapping core errors to HTTP responses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if self.0.is_submission_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.error_code(), "Request failed");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.error_code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// POST /executions
async fn create_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<CreateExecutionRequest>,
) -> ApiResult<(StatusCode, Json<CreateExecutionResponse>)> {
    let execution_id = orchestrator
        .start_execution(&req.code, req.external_functions, req.inputs)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateExecutionResponse { execution_id }),
    ))
}

/// GET /executions
async fn list_executions(
    State(orchestrator): State<Arc<Orchestrator>>,
) -> ApiResult<Json<Vec<PollReport>>> {
    Ok(Json(orchestrator.poll_all().await?))
}

/// GET /executions/{id}
async fn get_execution(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<PollReport>> {
    Ok(Json(orchestrator.poll(&execution_id).await?))
}

/// POST /webhook/complete
async fn complete_webhook(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(report): Json<JobReport>,
) -> ApiResult<Json<WebhookResponse>> {
    let reported = orchestrator.report_job(report).await?;
    Ok(Json(WebhookResponse {
        status: "ok".to_string(),
        execution_id: reported.execution_id,
        call_id: reported.call_id,
        applied: reported.update == CallUpdate::Applied,
    }))
}

/// GET /health
async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let database = match orchestrator.persistence().health_check_db().await {
        Ok(healthy) => healthy,
        Err(e) => {
            error!(error = %e, "Database health check failed");
            false
        }
    };
    let (status, label) = if database {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            database,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::executor::testing::registry;
    use crate::orchestrator::PollStatus;
    use crate::persistence::{CallStatus, SqlitePersistence};

    async fn orchestrator() -> Arc<Orchestrator> {
        let engine = MockEngine::new(vec![vec![(0, "add", vec![json!(1), json!(2)])]]);
        Arc::new(Orchestrator::new(
            Arc::new(SqlitePersistence::in_memory().await.unwrap()),
            Arc::new(engine),
            registry(),
        ))
    }

    async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_create_and_poll_execution() {
        let orchestrator = orchestrator().await;
        let app = router(orchestrator.clone());

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/executions",
            Some(json!({"code": "program", "external_functions": ["add"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["execution_id"].as_str().unwrap().to_string();

        // Not started yet: pending with no calls
        let (status, body) = send(app.clone(), Method::GET, &format!("/executions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let report: PollReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.status, PollStatus::Pending);
        assert!(report.pending_calls.is_empty());

        orchestrator.process_execution(&id, None).await.unwrap();

        let (status, body) = send(app.clone(), Method::GET, &format!("/executions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let report: PollReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.status, PollStatus::Pending);
        assert_eq!(report.pending_calls.len(), 1);
        assert_eq!(report.pending_calls[0].function_name, "math.add");
        assert_eq!(report.pending_calls[0].status, CallStatus::Pending);

        let (status, body) = send(app, Method::GET, "/executions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_function_is_bad_request() {
        let app = router(orchestrator().await);

        let (status, body) = send(
            app,
            Method::POST,
            "/executions",
            Some(json!({"code": "program", "external_functions": ["nope"]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "FUNCTION_RESOLUTION_FAILED");
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let app = router(orchestrator().await);

        let (status, body) = send(app, Method::GET, "/executions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "EXECUTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_webhook_completes_call() {
        let orchestrator = orchestrator().await;
        let app = router(orchestrator.clone());

        let id = orchestrator
            .start_execution("program", ["add"], Map::new())
            .await
            .unwrap();
        orchestrator.process_execution(&id, None).await.unwrap();
        orchestrator
            .persistence()
            .mark_call_submitted(&id, 0, "job-1")
            .await
            .unwrap();

        let (status, body) = send(
            app.clone(),
            Method::POST,
            "/webhook/complete",
            Some(json!({"job_id": "job-1", "status": "finished", "result": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["execution_id"], json!(id));
        assert_eq!(body["call_id"], 0);
        assert_eq!(body["applied"], true);

        let report = orchestrator.poll(&id).await.unwrap();
        assert_eq!(report.status, PollStatus::Completed);
        assert_eq!(report.output, Some(json!(3)));

        // A duplicate delivery is accepted but changes nothing
        let (status, body) = send(
            app,
            Method::POST,
            "/webhook/complete",
            Some(json!({"job_id": "job-1", "status": "failed", "error": "late"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["applied"], false);
    }

    #[tokio::test]
    async fn test_webhook_unknown_job_is_not_found() {
        let app = router(orchestrator().await);

        let (status, body) = send(
            app,
            Method::POST,
            "/webhook/complete",
            Some(json!({"job_id": "ghost", "status": "finished", "result": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "JOB_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(orchestrator().await);

        let (status, body) = send(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], true);
    }
}
