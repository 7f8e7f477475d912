//! Build endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use keel_core::{Build, BuildId, BuildStatus, Event, NewBuild, RepoId};

const DEFAULT_PER_PAGE: i64 = 10;
const MAX_PER_PAGE: i64 = 100;

/// Endpoints scoped to one repository, nested under `/repos`.
pub fn repo_router() -> Router<AppState> {
    Router::new()
        .route("/{repo_id}/builds", get(list_builds).post(create_build))
        .route("/{repo_id}/builds/last", get(last_build))
        .route("/{repo_id}/builds/count", get(count_repo_builds))
        .route("/{repo_id}/builds/{number}", get(get_build))
}

/// Endpoints addressing builds by id, nested under `/builds`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_all_builds))
        .route("/count", get(count_builds))
        .route("/{id}", get(get_build_by_id).delete(delete_build))
        .route("/{id}/status", put(report_status))
        .route("/{id}/cancel", post(cancel_build))
}

#[derive(Debug, Serialize)]
struct CountResponse {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct CreateBuildRequest {
    event: Event,
    #[serde(default)]
    branch: String,
    /// Raw pipeline definition.
    pipeline: String,
}

async fn create_build(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Json(req): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let repo_id = repo_id_from(repo_id)?;
    let pipeline = state.compiler.compile(&req.pipeline)?;

    let build = state
        .orchestrator
        .allocate_and_create(NewBuild::new(repo_id, req.event, req.branch), &pipeline)
        .await?;
    Ok((StatusCode::CREATED, Json(build)))
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    event: Option<Event>,
}

async fn list_builds(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<Build>>, ApiError> {
    let repo_id = repo_id_from(repo_id)?;
    let page = query.page.unwrap_or(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).min(MAX_PER_PAGE);

    let builds = match query.event {
        Some(event) => {
            state
                .store
                .list_by_event(repo_id, event, page, per_page)
                .await?
        }
        None => state.store.list(repo_id, page, per_page).await?,
    };
    Ok(Json(builds))
}

#[derive(Debug, Deserialize)]
struct LastBuildQuery {
    branch: Option<String>,
}

async fn last_build(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Query(query): Query<LastBuildQuery>,
) -> Result<Json<Build>, ApiError> {
    let repo_id = repo_id_from(repo_id)?;
    let build = match query.branch {
        Some(branch) => state.store.get_last_by_branch(repo_id, &branch).await?,
        None => state.store.get_last(repo_id).await?,
    };
    Ok(Json(build))
}

#[derive(Debug, Deserialize)]
struct CountRepoQuery {
    event: Option<Event>,
}

async fn count_repo_builds(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    Query(query): Query<CountRepoQuery>,
) -> Result<Json<CountResponse>, ApiError> {
    let repo_id = repo_id_from(repo_id)?;
    let count = match query.event {
        Some(event) => state.store.count_by_repo_and_event(repo_id, event).await?,
        None => state.store.count_by_repo(repo_id).await?,
    };
    Ok(Json(CountResponse { count }))
}

async fn get_build(
    State(state): State<AppState>,
    Path((repo_id, number)): Path<(i64, i64)>,
) -> Result<Json<Build>, ApiError> {
    let repo_id = repo_id_from(repo_id)?;
    Ok(Json(state.store.get(repo_id, number).await?))
}

async fn list_all_builds(State(state): State<AppState>) -> Result<Json<Vec<Build>>, ApiError> {
    Ok(Json(state.store.list_all().await?))
}

#[derive(Debug, Deserialize)]
struct CountQuery {
    status: Option<BuildStatus>,
}

async fn count_builds(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CountResponse>, ApiError> {
    let count = match query.status {
        Some(status) => state.store.count_by_status(status).await?,
        None => state.store.count().await?,
    };
    Ok(Json(CountResponse { count }))
}

async fn get_build_by_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(state.store.get_by_id(BuildId::new(id)).await?))
}

async fn delete_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(BuildId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    status: BuildStatus,
    #[serde(default)]
    error: Option<String>,
}

async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(report): Json<StatusReport>,
) -> Result<Json<Build>, ApiError> {
    let build = state
        .orchestrator
        .report(BuildId::new(id), report.status, report.error)
        .await?;
    Ok(Json(build))
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(state.orchestrator.cancel(BuildId::new(id)).await?))
}

fn repo_id_from(raw: i64) -> Result<RepoId, ApiError> {
    if raw < 1 {
        return Err(ApiError::BadRequest(format!(
            "repo id must be positive, got {}",
            raw
        )));
    }
    Ok(RepoId::new(raw))
}

#[cfg(test)]
mod tests {
    use crate::AppState;
    use crate::routes;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request, StatusCode};
    use keel_config::{QueueConfig, ServerConfig};
    use keel_db::Database;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const PIPELINE: &str = r#"
        pipeline "hello"
        step "test" {
            image "alpine"
            run "true"
        }
    "#;

    async fn app() -> axum::Router {
        let config = ServerConfig {
            queue: QueueConfig {
                routes: vec!["gpu".to_string()],
                ..QueueConfig::default()
            },
            ..ServerConfig::default()
        };
        let state = AppState::new(Database::in_memory().await.unwrap(), &config).unwrap();
        routes::router(state)
    }

    async fn send(
        app: &axum::Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create(
        app: &axum::Router,
        repo: i64,
        branch: &str,
        pipeline: &str,
    ) -> (StatusCode, Value) {
        send(
            app,
            Method::POST,
            &format!("/api/v1/repos/{}/builds", repo),
            Some(json!({ "event": "push", "branch": branch, "pipeline": pipeline })),
        )
        .await
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let app = app().await;

        let (status, build) = create(&app, 1, "main", PIPELINE).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(build["number"], 1);
        assert_eq!(build["status"], "pending");
        assert_eq!(build["route"], "vela");

        let (status, fetched) = send(&app, Method::GET, "/api/v1/repos/1/builds/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], build["id"]);

        let uri = format!("/api/v1/builds/{}", build["id"]);
        let (status, fetched) = send(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["number"], 1);

        let (status, length) = send(&app, Method::GET, "/api/v1/queue/vela/length", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(length["length"], 1);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_bad_request() {
        let app = app().await;

        let (status, body) = create(&app, 1, "main", "pipeline \"empty\"").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (_, count) = send(&app, Method::GET, "/api/v1/builds/count", None).await;
        assert_eq!(count["count"], 0);
    }

    #[tokio::test]
    async fn test_missing_secret_leaves_errored_build() {
        let app = app().await;
        let pipeline = r#"
            pipeline "hello"
            secret "TOKEN"
            step "test" {
                image "alpine"
            }
        "#;

        let (status, _) = create(&app, 1, "main", pipeline).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, build) = send(&app, Method::GET, "/api/v1/repos/1/builds/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(build["status"], "error");

        let (_, count) = send(&app, Method::GET, "/api/v1/builds/count?status=error", None).await;
        assert_eq!(count["count"], 1);
        let (_, length) = send(&app, Method::GET, "/api/v1/queue/vela/length", None).await;
        assert_eq!(length["length"], 0);
    }

    #[tokio::test]
    async fn test_list_last_and_count() {
        let app = app().await;
        create(&app, 1, "main", PIPELINE).await;
        create(&app, 1, "dev", PIPELINE).await;
        create(&app, 2, "main", PIPELINE).await;

        let (status, builds) = send(&app, Method::GET, "/api/v1/repos/1/builds", None).await;
        assert_eq!(status, StatusCode::OK);
        let numbers: Vec<i64> = builds
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["number"].as_i64().unwrap())
            .collect();
        assert_eq!(numbers, vec![2, 1]);

        let (_, page) = send(
            &app,
            Method::GET,
            "/api/v1/repos/1/builds?page=2&per_page=1&event=push",
            None,
        )
        .await;
        assert_eq!(page.as_array().unwrap().len(), 1);
        assert_eq!(page[0]["number"], 1);

        let (status, _) = send(&app, Method::GET, "/api/v1/repos/1/builds?page=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, last) = send(&app, Method::GET, "/api/v1/repos/1/builds/last?branch=main", None).await;
        assert_eq!(last["number"], 1);
        let (_, last) = send(&app, Method::GET, "/api/v1/repos/1/builds/last", None).await;
        assert_eq!(last["number"], 2);

        let (_, count) = send(&app, Method::GET, "/api/v1/repos/1/builds/count", None).await;
        assert_eq!(count["count"], 2);
        let (_, count) = send(&app, Method::GET, "/api/v1/repos/1/builds/count?event=tag", None).await;
        assert_eq!(count["count"], 0);

        let (_, all) = send(&app, Method::GET, "/api/v1/builds", None).await;
        assert_eq!(all.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_status_reports_and_cancel() {
        let app = app().await;
        let (_, build) = create(&app, 1, "main", PIPELINE).await;
        let base = format!("/api/v1/builds/{}", build["id"]);

        let (status, running) = send(
            &app,
            Method::PUT,
            &format!("{}/status", base),
            Some(json!({ "status": "running" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(running["status"], "running");

        let (status, canceled) =
            send(&app, Method::POST, &format!("{}/cancel", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(canceled["status"], "canceled");

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("{}/status", base),
            Some(json!({ "status": "success" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, current) = send(&app, Method::GET, &base, None).await;
        assert_eq!(current["status"], "canceled");
    }

    #[tokio::test]
    async fn test_delete() {
        let app = app().await;
        let (_, build) = create(&app, 1, "main", PIPELINE).await;
        let uri = format!("/api/v1/builds/{}", build["id"]);

        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
