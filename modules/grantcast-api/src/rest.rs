use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::{info, warn};

use grantcast_common::{BulkJob, ContentType, DeletionJob, JobBody};
use grantcast_store::queue::QueueName;

use crate::AppState;

/// Submissions larger than this are rejected outright; the bulk surface
/// exists for them.
pub const MAX_BULK_JOBS: usize = 1_000;

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
        .into_response()
}

fn bad_request(message: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message.to_string()})),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> axum::response::Response {
    warn!(error = %err, "enqueue failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
        .into_response()
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key == state.api_key)
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn add_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<JobBody>, JsonRejection>,
) -> axum::response::Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    // Malformed bodies (bad JSON, missing fields, unknown enum values) get
    // the same structured error shape as semantic validation failures.
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if let Err(err) = body.validate() {
        return bad_request(err);
    }

    let payload = match serde_json::to_value(&body) {
        Ok(payload) => payload,
        Err(err) => return bad_request(err),
    };
    match state.queue.enqueue(QueueName::Embeddings, payload).await {
        Ok(job_id) => {
            info!(%job_id, content_type = %body.content_type, "job queued");
            Json(serde_json::json!({"jobId": job_id, "status": "queued"})).into_response()
        }
        Err(err) => internal_error(err),
    }
}

pub async fn bulk_add_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    batch: Result<Json<BulkJob>, JsonRejection>,
) -> axum::response::Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let Json(batch) = match batch {
        Ok(batch) => batch,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if batch.jobs.is_empty() {
        return bad_request("jobs must not be empty");
    }
    if batch.jobs.len() > MAX_BULK_JOBS {
        return bad_request(format!("at most {MAX_BULK_JOBS} jobs per batch"));
    }
    for (index, job) in batch.jobs.iter().enumerate() {
        if let Err(err) = job.validate() {
            return bad_request(format!("job {index}: {err}"));
        }
    }

    let count = batch.jobs.len();
    let payload = match serde_json::to_value(&batch) {
        Ok(payload) => payload,
        Err(err) => return bad_request(err),
    };
    match state.queue.enqueue(QueueName::BulkEmbeddings, payload).await {
        Ok(job_id) => {
            info!(%job_id, count, "bulk job queued");
            Json(serde_json::json!({"jobId": job_id, "status": "queued", "count": count}))
                .into_response()
        }
        Err(err) => internal_error(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEmbeddingRequest {
    content_hash: String,
    #[serde(rename = "type")]
    content_type: ContentType,
}

pub async fn delete_embedding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Result<Json<DeleteEmbeddingRequest>, JsonRejection>,
) -> axum::response::Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if request.content_hash.trim().is_empty() {
        return bad_request("contentHash is required");
    }

    let job = DeletionJob {
        content_hash: request.content_hash,
        content_type: request.content_type,
    };
    let payload = match serde_json::to_value(&job) {
        Ok(payload) => payload,
        Err(err) => return bad_request(err),
    };
    match state.queue.enqueue(QueueName::Deletions, payload).await {
        Ok(job_id) => {
            info!(%job_id, content_hash = job.content_hash, "deletion queued");
            Json(serde_json::json!({"jobId": job_id, "status": "queued"})).into_response()
        }
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::body::Body;
    use axum::http::Request;
    use grantcast_store::memory::MemoryQueue;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn app() -> (axum::Router, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new());
        let state = Arc::new(AppState {
            queue: queue.clone(),
            api_key: KEY.to_string(),
        });
        (router(state), queue)
    }

    fn post_json(path: &str, key: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn add_job_enqueues_and_acks() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/add-job",
                Some(KEY),
                serde_json::json!({
                    "type": "cast",
                    "content": "Shipped v2 today",
                    "externalId": "0xcast",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        assert!(body["jobId"].is_string());
        assert_eq!(queue.pending(QueueName::Embeddings), 1);
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/add-job",
                None,
                serde_json::json!({
                    "type": "cast",
                    "content": "x",
                    "externalId": "1",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(queue.pending(QueueName::Embeddings), 0);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected_with_the_reason() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/add-job",
                Some(KEY),
                serde_json::json!({
                    "type": "cast",
                    "content": "   ",
                    "externalId": "1",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("content is required"));
        assert_eq!(queue.pending(QueueName::Embeddings), 0);
    }

    #[tokio::test]
    async fn unknown_content_type_gets_a_structured_error() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/add-job",
                Some(KEY),
                serde_json::json!({
                    "type": "not-a-real-type",
                    "content": "x",
                    "externalId": "1",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("not-a-real-type"));
        assert_eq!(queue.pending(QueueName::Embeddings), 0);
    }

    #[tokio::test]
    async fn malformed_json_body_gets_a_structured_error() {
        let (app, queue) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/add-job")
                    .header("content-type", "application/json")
                    .header("x-api-key", KEY)
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].is_string());
        assert_eq!(queue.pending(QueueName::Embeddings), 0);
    }

    #[tokio::test]
    async fn bulk_rejects_batch_when_any_job_is_invalid() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/bulk-add-job",
                Some(KEY),
                serde_json::json!({
                    "jobs": [
                        {"type": "cast", "content": "ok", "externalId": "1"},
                        {"type": "cast", "content": "ok", "externalId": ""},
                    ]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("job 1:"));
        assert_eq!(queue.pending(QueueName::BulkEmbeddings), 0);
    }

    #[tokio::test]
    async fn bulk_enqueues_one_batch_job() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/bulk-add-job",
                Some(KEY),
                serde_json::json!({
                    "jobs": [
                        {"type": "cast", "content": "one", "externalId": "1"},
                        {"type": "grant", "content": "two", "externalId": "2"},
                    ]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(queue.pending(QueueName::BulkEmbeddings), 1);
    }

    #[tokio::test]
    async fn delete_embedding_enqueues_a_deletion() {
        let (app, queue) = app();
        let response = app
            .oneshot(post_json(
                "/delete-embedding",
                Some(KEY),
                serde_json::json!({"contentHash": "abc123", "type": "cast"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(queue.pending(QueueName::Deletions), 1);
        let payload = &queue.payloads(QueueName::Deletions)[0];
        let job: DeletionJob = serde_json::from_value(payload.clone()).unwrap();
        assert_eq!(job.content_hash, "abc123");
        assert_eq!(job.content_type, ContentType::Cast);
    }

    #[tokio::test]
    async fn health_needs_no_key() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
