//! HTTP/JSON surface for the task graph daemon.
//!
//! Routes live under `/v1/...`; the project-scoped alias
//! `/v1/projects/<prefix>/...` is rewritten onto the same table after the
//! prefix is checked. Typed errors render as `{error, code, error_code}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use grns_core::transfer::{DedupePolicy, ImportOptions, OrphanHandling};
use grns_core::{canon, Error, ErrorBody, GitRefId, TaskId, TaskStatus, TaskType};
use serde::Deserialize;
use tracing::{error, info};

use crate::query::TaskFilter;
use crate::storage::{CloseAnnotation, CreateTask, NewGitRef, Storage, TaskPatch};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub storage: Arc<Storage>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/close", post(close_tasks))
        .route("/v1/tasks/reopen", post(reopen_tasks))
        .route(
            "/v1/tasks/{id}",
            get(show_task).patch(update_task).delete(delete_task),
        )
        .route(
            "/v1/tasks/{id}/labels",
            post(add_labels).delete(remove_labels),
        )
        .route("/v1/tasks/{id}/deps", post(add_dep).delete(remove_dep))
        .route(
            "/v1/tasks/{id}/git-refs",
            post(create_git_ref).get(list_git_refs),
        )
        .route(
            "/v1/git-refs/{ref_id}",
            get(show_git_ref).delete(delete_git_ref),
        )
        .route("/v1/export", get(export_tasks))
        .route("/v1/import", post(import_tasks))
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            project_scope,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Rewrite `/v1/projects/<prefix>/...` onto the global route table after
/// validating the prefix.
async fn project_scope(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if let Some(rest) = path.strip_prefix("/v1/projects/") {
        let (prefix, remainder) = rest.split_once('/').unwrap_or((rest, ""));
        if prefix != state.storage.prefix() {
            return ApiError(Error::not_found(format!("unknown project: {prefix}")))
                .into_response();
        }
        let rewritten = match req.uri().query() {
            Some(q) => format!("/v1/{remainder}?{q}"),
            None => format!("/v1/{remainder}"),
        };
        match rewritten.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(_) => {
                return ApiError(Error::invalid("malformed request path")).into_response();
            }
        }
    }
    next.run(req).await
}

// --- Error plumbing ---

/// Newtype so `grns_core::Error` can render as an HTTP response.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self.0, Error::Internal(_)) {
            error!("internal error: {}", self.0);
        }
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Unwrap a JSON body, turning axum's rejection into the standard error shape.
fn require_json<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rej) => Err(ApiError(Error::invalid(format!(
            "invalid request body: {}",
            rej.body_text()
        )))),
    }
}

fn require_query<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    match query {
        Ok(Query(value)) => Ok(value),
        Err(rej) => Err(ApiError(Error::invalid(format!(
            "invalid query parameters: {}",
            rej.body_text()
        )))),
    }
}

// --- Request types ---

#[derive(Debug, Default, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub spec_id: Option<String>,
    #[serde(default)]
    pub source_repo: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub deps: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub spec_id: Option<String>,
    #[serde(default)]
    pub source_repo: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct BatchIdsRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LabelsRequest {
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DepRequest {
    pub parent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GitRefRequest {
    #[serde(default)]
    pub repo: Option<String>,
    pub relation: String,
    pub object_type: String,
    pub object_value: String,
    #[serde(default)]
    pub resolved_commit: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub ids: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "label-any", default)]
    pub label_any: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub spec: Option<String>,
    #[serde(rename = "updated-before", default)]
    pub updated_before: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub ready: Option<bool>,
    #[serde(rename = "stale-days", default)]
    pub stale_days: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub dedupe: Option<String>,
    #[serde(default)]
    pub orphan_handling: Option<String>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

// --- Parsing helpers ---

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_task_ids<I, S>(raw: I) -> Result<Vec<TaskId>, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().map(|s| TaskId::parse(s.as_ref())).collect()
}

fn parse_statuses(raw: &str) -> Result<Vec<TaskStatus>, Error> {
    csv(raw).iter().map(|s| TaskStatus::parse(s)).collect()
}

/// Accept an ISO-8601 timestamp, a bare date, or epoch seconds.
fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(secs) = raw.parse::<i64>() {
        if let Some(ts) = DateTime::from_timestamp(secs, 0) {
            return Ok(ts);
        }
    }
    Err(Error::invalid(format!("invalid updated-before: {raw}")))
}

fn build_create(req: CreateTaskRequest) -> Result<CreateTask, Error> {
    let title = canon::title(req.title.as_deref().unwrap_or_default())?;
    Ok(CreateTask {
        id: req.id.as_deref().map(TaskId::parse).transpose()?,
        title,
        task_type: req
            .task_type
            .as_deref()
            .map(TaskType::parse)
            .transpose()?
            .unwrap_or_default(),
        status: req
            .status
            .as_deref()
            .map(TaskStatus::parse)
            .transpose()?
            .unwrap_or_default(),
        priority: req.priority.map(canon::priority).transpose()?.unwrap_or(2),
        description: req.description,
        acceptance: req.acceptance,
        assignee: req.assignee,
        parent: req.parent.as_deref().map(TaskId::parse).transpose()?,
        spec_id: req.spec_id,
        source_repo: req.source_repo.as_deref().map(canon::repo_slug).transpose()?,
        labels: canon::labels(req.labels.unwrap_or_default()),
        custom: req.custom.unwrap_or_default(),
        deps: parse_task_ids(req.deps.unwrap_or_default())?,
    })
}

fn build_patch(req: UpdateTaskRequest) -> Result<TaskPatch, Error> {
    Ok(TaskPatch {
        title: req.title.as_deref().map(canon::title).transpose()?,
        task_type: req.task_type.as_deref().map(TaskType::parse).transpose()?,
        status: req.status.as_deref().map(TaskStatus::parse).transpose()?,
        priority: req.priority.map(canon::priority).transpose()?,
        description: req.description,
        acceptance: req.acceptance,
        assignee: req.assignee,
        parent: req.parent.as_deref().map(TaskId::parse).transpose()?,
        spec_id: req.spec_id,
        source_repo: req.source_repo.as_deref().map(canon::repo_slug).transpose()?,
        labels: req.labels.map(canon::labels),
        custom: req.custom,
    })
}

fn build_filter(query: ListQuery) -> Result<TaskFilter, Error> {
    Ok(TaskFilter {
        labels_all: canon::labels(query.label.as_deref().map(csv).unwrap_or_default()),
        labels_any: canon::labels(query.label_any.as_deref().map(csv).unwrap_or_default()),
        statuses: query
            .status
            .as_deref()
            .map(parse_statuses)
            .transpose()?
            .unwrap_or_default(),
        task_type: query.task_type.as_deref().map(TaskType::parse).transpose()?,
        spec_regex: query.spec,
        updated_before: query
            .updated_before
            .as_deref()
            .map(parse_cutoff)
            .transpose()?,
        search: query.search,
        ready: query.ready.unwrap_or(false),
        stale_days: query.stale_days,
        limit: query.limit,
        offset: query.offset,
    })
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = require_json(body)?;
    let create = build_create(req)?;
    let task = state.storage.create_task(create).await?;
    info!(task_id = %task.id, "created task");
    Ok((StatusCode::CREATED, Json(task)))
}

async fn show_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = TaskId::parse(&id)?;
    let task = state.storage.get_task(&id).await?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<UpdateTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = TaskId::parse(&id)?;
    let patch = build_patch(require_json(body)?)?;
    let task = state.storage.update_task(&id, patch).await?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = TaskId::parse(&id)?;
    state.storage.delete_task(&id).await?;
    info!(task_id = %id, "deleted task");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let query = require_query(query)?;

    // Batch get short-circuits the filters and preserves request order.
    if let Some(ids) = &query.ids {
        let ids = parse_task_ids(csv(ids))?;
        let tasks = state.storage.get_tasks_ordered(&ids).await?;
        return Ok(Json(tasks));
    }

    let filter = build_filter(query)?;
    let tasks = state.storage.list_tasks(&filter).await?;
    Ok(Json(tasks))
}

async fn close_tasks(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BatchIdsRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = require_json(body)?;
    let ids = parse_task_ids(&req.ids)?;

    let annotation = match (&req.commit, &req.repo) {
        (Some(commit), repo) => Some(CloseAnnotation {
            commit: canon::git_hash(commit)?,
            repo: repo.as_deref().map(canon::repo_slug).transpose()?,
        }),
        (None, Some(_)) => {
            return Err(ApiError(Error::invalid("repo requires a commit")));
        }
        (None, None) => None,
    };

    let outcome = state.storage.close_tasks(&ids, annotation).await?;
    info!(closed = outcome.closed, annotated = outcome.annotated, "closed tasks");
    Ok(Json(outcome))
}

async fn reopen_tasks(
    State(state): State<Arc<AppState>>,
    body: Result<Json<BatchIdsRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = require_json(body)?;
    let ids = parse_task_ids(&req.ids)?;
    let reopened = state.storage.reopen_tasks(&ids).await?;
    Ok(Json(serde_json::json!({ "reopened": reopened })))
}

async fn add_labels(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<LabelsRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = TaskId::parse(&id)?;
    let labels = canon::labels(require_json(body)?.labels);
    let task = state.storage.add_labels(&id, &labels).await?;
    Ok(Json(task))
}

async fn remove_labels(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<LabelsRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = TaskId::parse(&id)?;
    let labels = canon::labels(require_json(body)?.labels);
    let task = state.storage.remove_labels(&id, &labels).await?;
    Ok(Json(task))
}

async fn add_dep(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<DepRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let child = TaskId::parse(&id)?;
    let parent = TaskId::parse(&require_json(body)?.parent_id)?;
    let task = state.storage.add_dep(&child, &parent).await?;
    Ok(Json(task))
}

async fn remove_dep(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<DepRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let child = TaskId::parse(&id)?;
    let parent = TaskId::parse(&require_json(body)?.parent_id)?;
    let task = state.storage.remove_dep(&child, &parent).await?;
    Ok(Json(task))
}

async fn create_git_ref(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<GitRefRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let task_id = TaskId::parse(&id)?;
    let req = require_json(body)?;
    let object_type = grns_core::GitObjectType::parse(&req.object_type)?;
    let git_ref = state
        .storage
        .insert_git_ref(
            &task_id,
            NewGitRef {
                repo: req.repo,
                relation: req.relation,
                object_type,
                object_value: req.object_value,
                resolved_commit: req.resolved_commit,
                note: req.note,
                meta: req.meta,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(git_ref)))
}

async fn list_git_refs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task_id = TaskId::parse(&id)?;
    let refs = state.storage.list_git_refs(&task_id).await?;
    Ok(Json(refs))
}

async fn show_git_ref(
    State(state): State<Arc<AppState>>,
    Path(ref_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ref_id = GitRefId::parse(&ref_id)?;
    let git_ref = state.storage.get_git_ref(&ref_id).await?;
    Ok(Json(git_ref))
}

async fn delete_git_ref(
    State(state): State<Arc<AppState>>,
    Path(ref_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ref_id = GitRefId::parse(&ref_id)?;
    state.storage.delete_git_ref(&ref_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_tasks(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let tasks = state.storage.export_tasks().await?;
    let body = crate::transfer::render_export(&tasks)?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    ))
}

async fn import_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ImportQuery>, QueryRejection>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let query = require_query(query)?;
    let opts = ImportOptions {
        dedupe: query
            .dedupe
            .as_deref()
            .map(DedupePolicy::parse)
            .transpose()?
            .unwrap_or_default(),
        orphans: query
            .orphan_handling
            .as_deref()
            .map(OrphanHandling::parse)
            .transpose()?
            .unwrap_or_default(),
        dry_run: query.dry_run.unwrap_or(false),
        stream: query.stream.unwrap_or(false),
    };
    let report = state.storage.import_tasks(&body, opts).await?;
    info!(
        created = report.created,
        skipped = report.skipped,
        errors = report.errors,
        dry_run = report.dry_run,
        "import finished"
    );
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn create_test_app() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path, "gr").await.unwrap();
        storage.migrate().await.unwrap();
        let state = Arc::new(AppState {
            storage: Arc::new(storage),
        });
        (create_router(state), dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_returns_created_with_task_body() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .oneshot(post_json(
                "/v1/tasks",
                serde_json::json!({"title": "  Auth ", "type": "BUG", "priority": 3,
                    "labels": ["Bug", "bug", "Auth"]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let task = body_json(response).await;
        assert_eq!(task["title"], "Auth");
        assert_eq!(task["type"], "bug");
        assert_eq!(task["labels"], serde_json::json!(["auth", "bug"]));
        assert!(task["closed_at"].is_null());
    }

    #[tokio::test]
    async fn bad_priority_renders_error_contract() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .oneshot(post_json(
                "/v1/tasks",
                serde_json::json!({"title": "x", "priority": 9}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "priority must be between 0 and 4");
        assert_eq!(body["code"], "invalid_argument");
        assert!(body["error_code"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn project_scoped_alias_hits_same_routes() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/projects/gr/tasks",
                serde_json::json!({"title": "scoped"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let task = body_json(response).await;
        let id = task["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/v1/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_project_prefix_is_not_found() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .oneshot(post_json(
                "/v1/projects/zz/tasks",
                serde_json::json!({"title": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn malformed_json_body_is_invalid_argument() {
        let (app, _dir) = create_test_app().await;
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "invalid_argument");
    }
}
