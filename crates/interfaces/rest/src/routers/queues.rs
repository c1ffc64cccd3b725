use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use valet_notify::NotificationPriority;
use valet_queue::QueueError;

use crate::auth::{AuthUser, bearer_token};
use crate::{AppState, error_response, unauthorized};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/api/push", post(push))
        .route("/api/get-queue/{queue_name}", get(get_queue))
        .route("/api/reset-queues", post(reset_queues))
        .route("/api/get-job-interactions/{job_id}", get(get_job_interactions))
        .route("/api/jobs/{job_id}/message", post(send_job_message))
        .route("/api/init-session", post(init_session))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, Response> {
    bearer_token(headers)
        .and_then(|token| state.verifier.verify(token))
        .ok_or_else(unauthorized)
}

#[derive(Debug, Deserialize)]
struct PushBody {
    question: Option<String>,
    websocket_id: Option<String>,
}

async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PushBody>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Some(question) = body.question else {
        return error_response(QueueError::Validation("question is required".to_string()));
    };

    match state
        .scheduler
        .enqueue(&question, body.websocket_id.clone(), &user.user_id, &user.email)
        .await
    {
        Ok(receipt) => Json(json!({
            "status": receipt.status,
            "job_id": receipt.id_hash,
            "websocket_id": body.websocket_id,
            "user_id": user.user_id,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct QueueQuery {
    user_filter: Option<String>,
}

async fn get_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(queue_name): Path<String>,
    Query(query): Query<QueueQuery>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    match state
        .scheduler
        .get_queue(&queue_name, &user.requester(), query.user_filter.as_deref())
        .await
    {
        Ok(view) => {
            let key = format!("{}_jobs_metadata", view.queue);
            Json(json!({
                key: view.jobs,
                "filtered_by": view.filtered_by,
                "is_admin_view": view.is_admin_view,
                "total_jobs": view.total_jobs,
            }))
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn reset_queues(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let _user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let counts = state.scheduler.reset().await;
    Json(json!({ "status": "reset", "cleared": counts })).into_response()
}

async fn get_job_interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };

    match state
        .scheduler
        .job_interactions(&job_id, &user.requester())
        .await
    {
        Ok((job, notifications)) => Json(json!({
            "job": job,
            "notifications": notifications,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: Option<String>,
    priority: Option<String>,
}

async fn send_job_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Some(message) = body.message else {
        return error_response(QueueError::Validation("message is required".to_string()));
    };
    let priority = match body.priority.as_deref() {
        None => NotificationPriority::Medium,
        Some(raw) => match NotificationPriority::parse(raw) {
            Some(priority) => priority,
            None => {
                return error_response(QueueError::Validation(format!(
                    "unknown priority '{raw}'"
                )));
            }
        },
    };

    match state
        .scheduler
        .deliver_user_message(&job_id, &user.requester(), &message, priority)
        .await
    {
        Ok(notification_id) => Json(json!({
            "status": "queued",
            "job_id": job_id,
            "notification_id": notification_id,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

/// Mint a session id and bind it to the caller so the WebSocket connect can
/// pick the user up without re-authenticating.
async fn init_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let session_id = valet_queue::two_word_tag(&uuid::Uuid::new_v4().to_string());
    state.fabric.pre_register_session(&session_id, &user.user_id);
    Json(json!({ "session_id": session_id, "user_id": user.user_id })).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::bail;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use valet_config::ConfigSnapshot;
    use valet_exec::CodeRunner;
    use valet_llm::{Completion, CompletionClient, EmbeddingClient, LlmSpec};
    use valet_memory::{EmbeddingService, GistNormalizer, IoLog, SnapshotStore};
    use valet_notify::{Fabric, NotificationLog};
    use valet_queue::{IoSink, Scheduler};

    use crate::auth::StaticTokenVerifier;
    use crate::{AppState, build_router};

    #[derive(Debug)]
    struct NoLlm;

    #[async_trait::async_trait]
    impl CompletionClient for NoLlm {
        async fn complete(&self, _spec: &LlmSpec, _prompt: &str) -> anyhow::Result<Completion> {
            bail!("no llm in router tests")
        }
    }

    #[derive(Debug)]
    struct NoEmbeddings;

    #[async_trait::async_trait]
    impl EmbeddingClient for NoEmbeddings {
        async fn embed(&self, _model: &str, _text: &str) -> anyhow::Result<Vec<f32>> {
            bail!("no embeddings in router tests")
        }
    }

    fn test_app() -> (tempfile::TempDir, axum::Router) {
        let dir = tempfile::tempdir().unwrap();
        let embeddings = Arc::new(
            EmbeddingService::open(
                dir.path().join("cache.redb"),
                Arc::new(NoEmbeddings),
                GistNormalizer::default(),
                "stub",
                false,
            )
            .unwrap(),
        );
        let snapshots = Arc::new(Mutex::new(
            SnapshotStore::open(dir.path().join("solutions"), embeddings.clone()).unwrap(),
        ));
        let io_log = Arc::new(IoLog::new(dir.path().join("io.jsonl"), embeddings));
        let fabric = Arc::new(Fabric::new());
        let scheduler = Arc::new(Scheduler::new(
            ConfigSnapshot::default(),
            Arc::new(NoLlm),
            CodeRunner::new("sh", Duration::from_secs(5)),
            snapshots,
            IoSink::Sync(io_log),
            fabric.clone(),
            Arc::new(NotificationLog::new(dir.path().join("notifications.jsonl"))),
        ));
        let verifier = Arc::new(
            StaticTokenVerifier::new()
                .with_user("mock_token_alice", "alice", "alice@example.com", false)
                .with_user("mock_token_root", "root", "root@example.com", true),
        );
        let app = build_router(AppState { scheduler, fabric, verifier });
        (dir, app)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(request: Request<Body>) -> Request<Body> {
        let (mut parts, body) = request.into_parts();
        parts
            .headers
            .insert("authorization", "Bearer mock_token_alice".parse().unwrap());
        Request::from_parts(parts, body)
    }

    #[tokio::test]
    async fn push_requires_auth() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/api/push")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_enqueues_and_returns_job_id() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(authed(
                Request::post("/api/push")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"question":"what time is it","websocket_id":"wise penguin"}"#,
                    ))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "queued");
        assert_eq!(json["user_id"], "alice");
        assert_eq!(json["websocket_id"], "wise penguin");
        assert_eq!(json["job_id"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn push_without_question_is_400() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(authed(
                Request::post("/api/push")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn queue_views_and_filters_map_statuses() {
        let (_dir, app) = test_app();

        // Seed one job for alice.
        let response = app
            .clone()
            .oneshot(authed(
                Request::post("/api/push")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"question":"what time is it"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Own view contains the job under the queue-named key.
        let response = app
            .clone()
            .oneshot(authed(
                Request::get("/api/get-queue/todo").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_jobs"], 1);
        assert_eq!(json["todo_jobs_metadata"].as_array().unwrap().len(), 1);
        assert_eq!(json["filtered_by"], "alice");
        assert_eq!(json["is_admin_view"], false);

        // Unknown queue name → 400.
        let response = app
            .clone()
            .oneshot(authed(
                Request::get("/api/get-queue/bogus").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Wildcard as a regular user → 403.
        let response = app
            .clone()
            .oneshot(authed(
                Request::get("/api/get-queue/todo?user_filter=*")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Wildcard as admin sees alice's job.
        let response = app
            .oneshot(
                Request::get("/api/get-queue/todo?user_filter=*")
                    .header("authorization", "Bearer mock_token_root")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_jobs"], 1);
        assert_eq!(json["is_admin_view"], true);
    }

    #[tokio::test]
    async fn reset_reports_counts() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(authed(
                Request::post("/api/reset-queues").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["cleared"]["todo"], 0);
        assert_eq!(json["cleared"]["dead"], 0);
    }

    #[tokio::test]
    async fn unknown_job_interactions_is_404() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(authed(
                Request::get("/api/get-job-interactions/deadbeef")
                    .body(Body::empty())
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn message_to_unknown_job_is_404_and_bad_priority_400() {
        let (_dir, app) = test_app();
        let response = app
            .clone()
            .oneshot(authed(
                Request::post("/api/jobs/deadbeef/message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hi","priority":"urgent"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(authed(
                Request::post("/api/jobs/deadbeef/message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hi","priority":"shouty"}"#))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn init_session_mints_and_preregisters() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(authed(
                Request::post("/api/init-session").body(Body::empty()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let session_id = json["session_id"].as_str().unwrap();
        assert!(valet_notify::is_valid_session_id(session_id));
    }
}
