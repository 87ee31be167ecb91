//! HTTP client for the grnsd daemon.
//!
//! Thin wrapper over the `/v1` API; every command in the CLI maps to one or
//! two calls here. Structured error bodies are parsed back into the shared
//! taxonomy so exit paths can render them faithfully.

use grns_core::transfer::ImportReport;
use grns_core::{ErrorBody, GitRef, Task};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server not reachable at {addr}\n  → start with: grnsd\n  → or set GRNS_API_URL if using a different address")]
    ConnectionFailed { addr: String },

    #[error("{0}")]
    Api(grns_core::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::InvalidResponse(e.to_string())
        }
    }
}

impl ClientError {
    /// Structured body for `--json` error output; non-API failures render as
    /// internal errors so the shape stays uniform.
    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Api(err) => ErrorBody::from(err),
            other => ErrorBody::from(&grns_core::Error::internal(other.to_string())),
        }
    }
}

/// Request payload for POST /v1/tasks.
#[derive(Debug, Default, Serialize)]
pub struct CreateTaskBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
}

/// Request payload for PATCH /v1/tasks/{id}.
#[derive(Debug, Default, Serialize)]
pub struct UpdateTaskBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, String>>,
}

/// Request payload for POST /v1/tasks/{id}/git-refs.
#[derive(Debug, Default, Serialize)]
pub struct AttachBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub relation: String,
    pub object_type: String,
    pub object_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Optional list query parameters, mirrored from the server's filter surface.
#[derive(Debug, Default)]
pub struct ListParams {
    pub label: Option<String>,
    pub label_any: Option<String>,
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub spec: Option<String>,
    pub search: Option<String>,
    pub updated_before: Option<String>,
    pub ready: bool,
    pub stale_days: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListParams {
    fn to_query(&self) -> String {
        let mut params = Vec::new();
        let mut push = |key: &str, value: &str| {
            params.push(format!("{key}={}", urlencoding::encode(value)));
        };
        if let Some(v) = &self.label {
            push("label", v);
        }
        if let Some(v) = &self.label_any {
            push("label-any", v);
        }
        if let Some(v) = &self.status {
            push("status", v);
        }
        if let Some(v) = &self.task_type {
            push("type", v);
        }
        if let Some(v) = &self.spec {
            push("spec", v);
        }
        if let Some(v) = &self.search {
            push("search", v);
        }
        if let Some(v) = &self.updated_before {
            push("updated-before", v);
        }
        if self.ready {
            push("ready", "true");
        }
        if let Some(v) = self.stale_days {
            push("stale-days", &v.to_string());
        }
        if let Some(v) = self.limit {
            push("limit", &v.to_string());
        }
        if let Some(v) = self.offset {
            push("offset", &v.to_string());
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

/// Options carried to POST /v1/import.
#[derive(Debug, Default)]
pub struct ImportParams {
    pub stream: bool,
    pub dedupe: Option<String>,
    pub orphan_handling: Option<String>,
    pub dry_run: bool,
}

/// HTTP client for grnsd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// The server address (for `info` and error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        match response.json::<ErrorBody>().await {
            Ok(body) => ClientError::Api(body.into_error()),
            Err(e) => ClientError::InvalidResponse(e.to_string()),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Probe /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn create_task(&self, body: CreateTaskBody) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        self.decode(response).await
    }

    /// Fetch several tasks in the requested order.
    pub async fn show_tasks(&self, ids: &[String]) -> Result<Vec<Task>, ClientError> {
        let url = format!(
            "{}/v1/tasks?ids={}",
            self.base_url,
            urlencoding::encode(&ids.join(","))
        );
        let response = self.http.get(&url).send().await?;
        self.decode(response).await
    }

    pub async fn update_task(&self, id: &str, body: UpdateTaskBody) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks/{id}", self.base_url);
        let response = self
            .http
            .patch(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn close_tasks(
        &self,
        ids: &[String],
        commit: Option<&str>,
        repo: Option<&str>,
    ) -> Result<Value, ClientError> {
        let url = format!("{}/v1/tasks/close", self.base_url);
        let mut body = serde_json::json!({ "ids": ids });
        if let Some(commit) = commit {
            body["commit"] = Value::String(commit.to_string());
        }
        if let Some(repo) = repo {
            body["repo"] = Value::String(repo.to_string());
        }
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn reopen_tasks(&self, ids: &[String]) -> Result<Value, ClientError> {
        let url = format!("{}/v1/tasks/reopen", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn list_tasks(&self, params: &ListParams) -> Result<Vec<Task>, ClientError> {
        let url = format!("{}/v1/tasks{}", self.base_url, params.to_query());
        let response = self.http.get(&url).send().await?;
        self.decode(response).await
    }

    pub async fn add_labels(&self, id: &str, labels: &[String]) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks/{id}/labels", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "labels": labels }))
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn remove_labels(&self, id: &str, labels: &[String]) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks/{id}/labels", self.base_url);
        let response = self
            .http
            .delete(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "labels": labels }))
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn add_dep(&self, child: &str, parent: &str) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks/{child}/deps", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "parent_id": parent }))
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn remove_dep(&self, child: &str, parent: &str) -> Result<Task, ClientError> {
        let url = format!("{}/v1/tasks/{child}/deps", self.base_url);
        let response = self
            .http
            .delete(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "parent_id": parent }))
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn attach_git_ref(&self, id: &str, body: AttachBody) -> Result<GitRef, ClientError> {
        let url = format!("{}/v1/tasks/{id}/git-refs", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        self.decode(response).await
    }

    /// Fetch the whole graph as NDJSON.
    pub async fn export(&self) -> Result<String, ClientError> {
        let url = format!("{}/v1/export", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .text()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn import(
        &self,
        ndjson: String,
        params: &ImportParams,
    ) -> Result<ImportReport, ClientError> {
        let mut query = Vec::new();
        if params.stream {
            query.push("stream=true".to_string());
        }
        if let Some(dedupe) = &params.dedupe {
            query.push(format!("dedupe={}", urlencoding::encode(dedupe)));
        }
        if let Some(orphans) = &params.orphan_handling {
            query.push(format!(
                "orphan_handling={}",
                urlencoding::encode(orphans)
            ));
        }
        if params.dry_run {
            query.push("dry_run=true".to_string());
        }
        let suffix = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };

        let url = format!("{}/v1/import{suffix}", self.base_url);
        let response = self.http.post(&url).body(ndjson).send().await?;
        self.decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7070/");
        assert_eq!(client.addr(), "http://localhost:7070");
    }

    #[test]
    fn list_params_render_hyphenated_keys() {
        let params = ListParams {
            label: Some("bug,auth".into()),
            label_any: Some("frontend".into()),
            updated_before: Some("2026-01-01".into()),
            stale_days: Some(30),
            limit: Some(10),
            ..Default::default()
        };
        let query = params.to_query();
        assert!(query.starts_with('?'));
        assert!(query.contains("label=bug%2Cauth"));
        assert!(query.contains("label-any=frontend"));
        assert!(query.contains("updated-before=2026-01-01"));
        assert!(query.contains("stale-days=30"));
        assert!(query.contains("limit=10"));
    }

    #[test]
    fn empty_list_params_render_no_query() {
        assert_eq!(ListParams::default().to_query(), "");
    }

    #[test]
    fn create_body_omits_empty_fields() {
        let body = CreateTaskBody {
            title: "T".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"title": "T"}));
    }

    #[test]
    fn api_error_body_roundtrip() {
        let err = ClientError::Api(grns_core::Error::conflict("duplicate"));
        let body = err.body();
        assert_eq!(body.code, "conflict");
        assert_eq!(body.error_code, 3);
    }

    #[tokio::test]
    async fn check_health_fails_when_server_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        assert!(client.check_health().await.is_err());
    }
}
