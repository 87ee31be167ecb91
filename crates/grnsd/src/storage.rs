//! SQLite storage for the task graph.
//!
//! Owns the schema and all transactional mutations: task lifecycle, labels,
//! dependency edges, git references, and the repo catalog. Multi-statement
//! operations run in a single transaction so concurrent readers only ever see
//! committed aggregates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grns_core::{
    canon, DepEdge, Error, GitObjectType, GitRef, GitRefId, Result, Task, TaskId, TaskStatus,
    TaskType, DEP_TYPE_BLOCKS, RELATION_CLOSED_BY,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

/// Embedded schema, executed at startup. Idempotent.
const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

/// Bounded retries for generated-id collisions.
const ID_RETRIES: usize = 5;

/// Bounded retries when SQLite reports the database as busy.
const BUSY_RETRIES: u32 = 3;

/// Explicit column list for task queries; keeps row mapping stable if columns
/// are ever added via ALTER TABLE.
pub(crate) const TASK_COLUMNS: &str = "id, title, type, status, priority, description, \
    acceptance, assignee, parent_id, spec_id, source_repo, custom_json, \
    created_at, updated_at, closed_at";

const GIT_REF_COLUMNS: &str = "id, task_id, repo, relation, object_type, object_value, \
    resolved_commit, note, meta_json, created_at";

/// Fields for creating a task. All values are already canonical.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    /// Client-supplied id; `None` generates one from the project prefix.
    pub id: Option<TaskId>,
    pub title: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: u8,
    pub description: Option<String>,
    pub acceptance: Option<String>,
    pub assignee: Option<String>,
    pub parent: Option<TaskId>,
    pub spec_id: Option<String>,
    pub source_repo: Option<String>,
    pub labels: Vec<String>,
    pub custom: BTreeMap<String, String>,
    pub deps: Vec<TaskId>,
}

/// Partial update. `None` fields are preserved exactly.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub priority: Option<u8>,
    pub description: Option<String>,
    pub acceptance: Option<String>,
    pub assignee: Option<String>,
    pub parent: Option<TaskId>,
    pub spec_id: Option<String>,
    pub source_repo: Option<String>,
    pub labels: Option<Vec<String>>,
    pub custom: Option<BTreeMap<String, String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.task_type.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.description.is_none()
            && self.acceptance.is_none()
            && self.assignee.is_none()
            && self.parent.is_none()
            && self.spec_id.is_none()
            && self.source_repo.is_none()
            && self.labels.is_none()
            && self.custom.is_none()
    }
}

/// Fields for attaching a git reference. `repo` falls back to the owning
/// task's `source_repo` when absent; everything else is raw and is
/// canonicalized here.
#[derive(Debug, Clone)]
pub struct NewGitRef {
    pub repo: Option<String>,
    pub relation: String,
    pub object_type: GitObjectType,
    pub object_value: String,
    pub resolved_commit: Option<String>,
    pub note: Option<String>,
    pub meta: Option<serde_json::Value>,
}

/// Commit annotation applied during batch close. Values are canonical.
#[derive(Debug, Clone)]
pub struct CloseAnnotation {
    pub commit: String,
    pub repo: Option<String>,
}

/// Result of a batch close.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CloseOutcome {
    /// Tasks that transitioned to closed in this call.
    pub closed: u64,
    /// Newly inserted `closed_by` annotations.
    pub annotated: u64,
}

/// Storage backend for the daemon.
///
/// Reads run concurrently on the pool; all mutations are funneled through a
/// single writer lane so a read-then-write transaction never deadlocks on a
/// SQLite lock upgrade.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
    prefix: String,
    writer: tokio::sync::Mutex<()>,
}

/// A write transaction holding the writer lane for its whole lifetime.
pub(crate) struct WriteTxn<'a> {
    tx: sqlx::Transaction<'static, Sqlite>,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl<'a> std::ops::Deref for WriteTxn<'a> {
    type Target = sqlx::Transaction<'static, Sqlite>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl std::ops::DerefMut for WriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

impl WriteTxn<'_> {
    pub(crate) async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    pub(crate) async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}

impl Storage {
    /// Open (creating if necessary) the store at the given path.
    pub async fn new(db_path: &Path, prefix: &str) -> Result<Self> {
        grns_core::validate_prefix(prefix)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        Ok(Self {
            pool,
            prefix: prefix.to_string(),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Execute the embedded schema.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// The project prefix new task ids are minted under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Begin a write transaction, retrying a bounded number of times if the
    /// store reports itself busy. The returned guard holds the writer lane
    /// until commit or rollback.
    pub(crate) async fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let guard = self.writer.lock().await;
        let mut attempt = 0;
        let tx = loop {
            match self.pool.begin().await {
                Ok(tx) => break tx,
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "store busy, retrying write transaction");
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                }
                Err(e) => return Err(db_err(e)),
            }
        };
        Ok(WriteTxn { tx, _guard: guard })
    }

    // --- Task operations ---

    /// Insert a new task. Generated ids are retried on collision; a
    /// client-supplied id collision is a conflict.
    pub async fn create_task(&self, req: CreateTask) -> Result<Task> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let id = match req.id {
            Some(ref id) => {
                insert_task_row(&mut tx, id, &req, now).await.map_err(|e| {
                    if unique_violation(&e).is_some() {
                        Error::conflict(format!("task id already exists: {id}"))
                    } else {
                        db_err(e)
                    }
                })?;
                id.clone()
            }
            None => {
                let mut inserted = None;
                for _ in 0..ID_RETRIES {
                    let candidate = TaskId::generate(&self.prefix);
                    match insert_task_row(&mut tx, &candidate, &req, now).await {
                        Ok(()) => {
                            inserted = Some(candidate);
                            break;
                        }
                        Err(e) if unique_violation(&e).is_some() => continue,
                        Err(e) => return Err(db_err(e)),
                    }
                }
                inserted.ok_or_else(|| Error::internal("exhausted task id candidates"))?
            }
        };

        replace_labels(&mut tx, &id, &req.labels).await?;

        for parent in &req.deps {
            insert_dep_edge(&mut tx, &id, parent).await?;
        }

        let task = load_task(&mut tx, &id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Get a task with its labels and dep edges.
    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_task(&mut conn, id).await
    }

    /// Get several tasks, returned in the requested order. Any missing id
    /// fails the whole call.
    pub async fn get_tasks_ordered(&self, ids: &[TaskId]) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let rows = fetch_rows_by_ids(&mut conn, ids).await?;
        let mut by_id: HashMap<String, Task> = load_details(&mut conn, rows)
            .await?
            .into_iter()
            .map(|t| (t.id.as_str().to_string(), t))
            .collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.remove(id.as_str()) {
                Some(task) => out.push(task),
                None => return Err(Error::not_found(format!("task not found: {id}"))),
            }
        }
        Ok(out)
    }

    /// Apply a partial update. Fields absent from the patch are preserved.
    pub async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        if patch.is_empty() {
            return Err(Error::invalid("no fields to update"));
        }

        let mut tx = self.begin_write().await?;
        let current = load_task(&mut tx, id).await?;

        let status = patch.status.unwrap_or(current.status);
        let closed_at = match (current.status, status) {
            (TaskStatus::Closed, TaskStatus::Closed) => current.closed_at,
            (_, TaskStatus::Closed) => Some(Utc::now()),
            _ => None,
        };
        let updated_at = now_after(current.updated_at);

        let title = patch.title.unwrap_or(current.title);
        let task_type = patch.task_type.unwrap_or(current.task_type);
        let priority = patch.priority.unwrap_or(current.priority);
        let description = patch.description.or(current.description);
        let acceptance = patch.acceptance.or(current.acceptance);
        let assignee = patch.assignee.or(current.assignee);
        let parent = patch.parent.or(current.parent);
        let spec_id = patch.spec_id.or(current.spec_id);
        let source_repo = patch.source_repo.or(current.source_repo);
        let custom = patch.custom.unwrap_or(current.custom);

        sqlx::query(
            "UPDATE tasks SET title = ?1, type = ?2, status = ?3, priority = ?4, \
             description = ?5, acceptance = ?6, assignee = ?7, parent_id = ?8, \
             spec_id = ?9, source_repo = ?10, custom_json = ?11, updated_at = ?12, \
             closed_at = ?13 WHERE id = ?14",
        )
        .bind(&title)
        .bind(task_type.as_str())
        .bind(status.as_str())
        .bind(i64::from(priority))
        .bind(&description)
        .bind(&acceptance)
        .bind(&assignee)
        .bind(parent.as_ref().map(TaskId::as_str))
        .bind(&spec_id)
        .bind(&source_repo)
        .bind(custom_to_json(&custom)?)
        .bind(updated_at.timestamp_millis())
        .bind(closed_at.map(|t| t.timestamp_millis()))
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        if let Some(labels) = &patch.labels {
            replace_labels(&mut tx, id, labels).await?;
        }

        let task = load_task(&mut tx, id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Delete a task, cascading to labels, dep edges (both sides), and git
    /// references.
    pub async fn delete_task(&self, id: &TaskId) -> Result<()> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("task not found: {id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Add labels to a task. Already-present labels are ignored.
    pub async fn add_labels(&self, id: &TaskId, labels: &[String]) -> Result<Task> {
        let mut tx = self.begin_write().await?;
        let current = load_task(&mut tx, id).await?;

        let mut changed = false;
        for label in labels {
            let result =
                sqlx::query("INSERT OR IGNORE INTO task_labels (task_id, label) VALUES (?1, ?2)")
                    .bind(id.as_str())
                    .bind(label)
                    .execute(&mut **tx)
                    .await
                    .map_err(db_err)?;
            changed |= result.rows_affected() > 0;
        }
        if changed {
            touch_task(&mut tx, id, current.updated_at).await?;
        }

        let task = load_task(&mut tx, id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Remove labels from a task. Absent labels are ignored.
    pub async fn remove_labels(&self, id: &TaskId, labels: &[String]) -> Result<Task> {
        let mut tx = self.begin_write().await?;
        let current = load_task(&mut tx, id).await?;

        let mut changed = false;
        for label in labels {
            let result = sqlx::query("DELETE FROM task_labels WHERE task_id = ?1 AND label = ?2")
                .bind(id.as_str())
                .bind(label)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            changed |= result.rows_affected() > 0;
        }
        if changed {
            touch_task(&mut tx, id, current.updated_at).await?;
        }

        let task = load_task(&mut tx, id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Add a dependency edge. Idempotent: re-adding an existing edge is a
    /// no-op.
    pub async fn add_dep(&self, child: &TaskId, parent: &TaskId) -> Result<Task> {
        let mut tx = self.begin_write().await?;
        let current = load_task(&mut tx, child).await?;
        let inserted = insert_dep_edge(&mut tx, child, parent).await?;
        if inserted {
            touch_task(&mut tx, child, current.updated_at).await?;
        }
        let task = load_task(&mut tx, child).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Remove a dependency edge. Removing a non-existent edge succeeds.
    pub async fn remove_dep(&self, child: &TaskId, parent: &TaskId) -> Result<Task> {
        let mut tx = self.begin_write().await?;
        let current = load_task(&mut tx, child).await?;
        let result = sqlx::query(
            "DELETE FROM task_deps WHERE child_id = ?1 AND parent_id = ?2 AND dep_type = ?3",
        )
        .bind(child.as_str())
        .bind(parent.as_str())
        .bind(DEP_TYPE_BLOCKS)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            touch_task(&mut tx, child, current.updated_at).await?;
        }
        let task = load_task(&mut tx, child).await?;
        tx.commit().await?;
        Ok(task)
    }

    // --- Batch close / reopen ---

    /// Close a batch of tasks, optionally annotating each with a commit
    /// reference. All-or-nothing: a missing id fails the whole batch before
    /// any write.
    pub async fn close_tasks(
        &self,
        ids: &[TaskId],
        annotation: Option<CloseAnnotation>,
    ) -> Result<CloseOutcome> {
        let mut tx = self.begin_write().await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(load_task(&mut tx, id).await?);
        }

        // Resolve every annotation target before writing anything.
        let mut annotate: Vec<(TaskId, String)> = Vec::new();
        if let Some(ann) = &annotation {
            for task in &tasks {
                let repo = ann
                    .repo
                    .clone()
                    .or_else(|| task.source_repo.clone())
                    .ok_or_else(|| {
                        Error::invalid(format!("repo is required: task {} has no source repo", task.id))
                    })?;
                annotate.push((task.id.clone(), repo));
            }
        }

        let mut closed = 0u64;
        for task in &tasks {
            if task.status != TaskStatus::Closed {
                let now = now_after(task.updated_at);
                sqlx::query(
                    "UPDATE tasks SET status = ?1, closed_at = ?2, updated_at = ?3 WHERE id = ?4",
                )
                .bind(TaskStatus::Closed.as_str())
                .bind(now.timestamp_millis())
                .bind(now.timestamp_millis())
                .bind(task.id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
                closed += 1;
            }
        }

        let mut annotated = 0u64;
        if let Some(ann) = &annotation {
            for (task_id, repo) in &annotate {
                upsert_repo(&mut tx, repo).await?;
                let inserted = insert_git_ref_row(
                    &mut tx,
                    task_id,
                    repo,
                    RELATION_CLOSED_BY,
                    GitObjectType::Commit,
                    &ann.commit,
                    "",
                    None,
                    None,
                )
                .await?;
                if inserted.is_some() {
                    annotated += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(CloseOutcome { closed, annotated })
    }

    /// Reopen a batch of tasks. All-or-nothing on missing ids. Close
    /// annotations are left in place.
    pub async fn reopen_tasks(&self, ids: &[TaskId]) -> Result<u64> {
        let mut tx = self.begin_write().await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            tasks.push(load_task(&mut tx, id).await?);
        }

        let mut reopened = 0u64;
        for task in &tasks {
            if task.status != TaskStatus::Open {
                let now = now_after(task.updated_at);
                sqlx::query(
                    "UPDATE tasks SET status = ?1, closed_at = NULL, updated_at = ?2 WHERE id = ?3",
                )
                .bind(TaskStatus::Open.as_str())
                .bind(now.timestamp_millis())
                .bind(task.id.as_str())
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
                reopened += 1;
            }
        }

        tx.commit().await?;
        Ok(reopened)
    }

    // --- Git reference operations ---

    /// Attach a git reference to a task. The repo falls back to the task's
    /// `source_repo`; a duplicate per-task key is a conflict.
    pub async fn insert_git_ref(&self, task_id: &TaskId, req: NewGitRef) -> Result<GitRef> {
        let mut tx = self.begin_write().await?;
        let task = load_task(&mut tx, task_id).await?;

        let repo = match req.repo.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => canon::repo_slug(raw)?,
            _ => task
                .source_repo
                .clone()
                .ok_or_else(|| Error::invalid("repo is required"))?,
        };
        let relation = canon::relation(&req.relation)?;
        let object_value = canon::object_value(req.object_type, &req.object_value)?;
        let resolved = canon::resolved_commit(req.resolved_commit.as_deref())?;
        let note = req
            .note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from);

        upsert_repo(&mut tx, &repo).await?;

        let ref_id = insert_git_ref_row(
            &mut tx,
            task_id,
            &repo,
            &relation,
            req.object_type,
            &object_value,
            &resolved,
            note.as_deref(),
            req.meta.as_ref(),
        )
        .await?
        .ok_or_else(|| Error::conflict("git ref already exists"))?;

        let git_ref = load_git_ref(&mut tx, &ref_id).await?;
        tx.commit().await?;
        Ok(git_ref)
    }

    pub async fn get_git_ref(&self, ref_id: &GitRefId) -> Result<GitRef> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_git_ref(&mut conn, ref_id).await
    }

    /// List a task's git references, oldest first.
    pub async fn list_git_refs(&self, task_id: &TaskId) -> Result<Vec<GitRef>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        // Listing for a missing task is not_found, not an empty list.
        load_task(&mut conn, task_id).await?;

        let query = format!(
            "SELECT {GIT_REF_COLUMNS} FROM task_git_refs WHERE task_id = ?1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, GitRefRow>(&query)
            .bind(task_id.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(GitRefRow::into_git_ref).collect()
    }

    pub async fn delete_git_ref(&self, ref_id: &GitRefId) -> Result<()> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query("DELETE FROM task_git_refs WHERE id = ?1")
            .bind(ref_id.as_str())
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("git ref not found: {ref_id}")));
        }
        tx.commit().await?;
        Ok(())
    }
}

// --- Shared helpers (also used by the query and transfer modules) ---

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::internal(format!("database error: {e}"))
}

fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

fn unique_violation(e: &sqlx::Error) -> Option<&str> {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.message()),
        _ => None,
    }
}

/// Clamp `now` so a task's updated_at never decreases.
pub(crate) fn now_after(prev: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(prev)
}

fn custom_to_json(custom: &BTreeMap<String, String>) -> Result<Option<String>> {
    if custom.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(custom)
        .map(Some)
        .map_err(|e| Error::internal(format!("serialize custom fields: {e}")))
}

async fn insert_task_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    id: &TaskId,
    req: &CreateTask,
    now: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    let closed_at = (req.status == TaskStatus::Closed).then(|| now.timestamp_millis());
    let custom_json = if req.custom.is_empty() {
        None
    } else {
        serde_json::to_string(&req.custom).ok()
    };

    sqlx::query(
        "INSERT INTO tasks (id, title, type, status, priority, description, acceptance, \
         assignee, parent_id, spec_id, source_repo, custom_json, created_at, updated_at, \
         closed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )
    .bind(id.as_str())
    .bind(&req.title)
    .bind(req.task_type.as_str())
    .bind(req.status.as_str())
    .bind(i64::from(req.priority))
    .bind(&req.description)
    .bind(&req.acceptance)
    .bind(&req.assignee)
    .bind(req.parent.as_ref().map(TaskId::as_str))
    .bind(&req.spec_id)
    .bind(&req.source_repo)
    .bind(custom_json)
    .bind(now.timestamp_millis())
    .bind(now.timestamp_millis())
    .bind(closed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Replace a task's label set with the given (canonical) labels.
pub(crate) async fn replace_labels(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    id: &TaskId,
    labels: &[String],
) -> Result<()> {
    sqlx::query("DELETE FROM task_labels WHERE task_id = ?1")
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    for label in labels {
        sqlx::query("INSERT OR IGNORE INTO task_labels (task_id, label) VALUES (?1, ?2)")
            .bind(id.as_str())
            .bind(label)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

/// Insert a dep edge, validating both endpoints. Returns whether a new edge
/// was written.
async fn insert_dep_edge(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    child: &TaskId,
    parent: &TaskId,
) -> Result<bool> {
    if child == parent {
        return Err(Error::invalid("task cannot depend on itself"));
    }
    let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?1")
        .bind(parent.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(Error::not_found(format!("task not found: {parent}")));
    }

    let result = sqlx::query(
        "INSERT OR IGNORE INTO task_deps (child_id, parent_id, dep_type) VALUES (?1, ?2, ?3)",
    )
    .bind(child.as_str())
    .bind(parent.as_str())
    .bind(DEP_TYPE_BLOCKS)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn touch_task(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    id: &TaskId,
    prev_updated: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE id = ?2")
        .bind(now_after(prev_updated).timestamp_millis())
        .bind(id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn upsert_repo(tx: &mut sqlx::Transaction<'_, Sqlite>, slug: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO git_repos (slug) VALUES (?1)")
        .bind(slug)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Insert a git ref row. Returns `None` if an equivalent ref (same per-task
/// 5-tuple key) already exists; a generated-id collision is retried.
#[allow(clippy::too_many_arguments)]
async fn insert_git_ref_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    task_id: &TaskId,
    repo: &str,
    relation: &str,
    object_type: GitObjectType,
    object_value: &str,
    resolved_commit: &str,
    note: Option<&str>,
    meta: Option<&serde_json::Value>,
) -> Result<Option<GitRefId>> {
    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM task_git_refs WHERE task_id = ?1 AND repo = ?2 AND relation = ?3 \
         AND object_type = ?4 AND object_value = ?5 AND resolved_commit = ?6",
    )
    .bind(task_id.as_str())
    .bind(repo)
    .bind(relation)
    .bind(object_type.as_str())
    .bind(object_value)
    .bind(resolved_commit)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    if existing.is_some() {
        return Ok(None);
    }

    let meta_json = meta
        .map(|m| {
            serde_json::to_string(m)
                .map_err(|e| Error::internal(format!("serialize git ref meta: {e}")))
        })
        .transpose()?;
    let now = Utc::now().timestamp_millis();

    for _ in 0..ID_RETRIES {
        let ref_id = GitRefId::generate();
        let result = sqlx::query(
            "INSERT INTO task_git_refs (id, task_id, repo, relation, object_type, \
             object_value, resolved_commit, note, meta_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(ref_id.as_str())
        .bind(task_id.as_str())
        .bind(repo)
        .bind(relation)
        .bind(object_type.as_str())
        .bind(object_value)
        .bind(resolved_commit)
        .bind(note)
        .bind(&meta_json)
        .bind(now)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => return Ok(Some(ref_id)),
            // The 5-tuple was checked above inside this transaction, so a
            // unique violation here can only be an id collision.
            Err(e) if unique_violation(&e).is_some() => continue,
            Err(e) => return Err(db_err(e)),
        }
    }
    Err(Error::internal("exhausted git ref id candidates"))
}

// --- Row types and aggregate loading ---

#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: String,
    title: String,
    #[sqlx(rename = "type")]
    task_type: String,
    status: String,
    priority: i64,
    description: Option<String>,
    acceptance: Option<String>,
    assignee: Option<String>,
    parent_id: Option<String>,
    spec_id: Option<String>,
    source_repo: Option<String>,
    custom_json: Option<String>,
    created_at: i64,
    updated_at: i64,
    closed_at: Option<i64>,
}

impl TaskRow {
    fn into_task(self, labels: Vec<String>, deps: Vec<DepEdge>) -> Result<Task> {
        let custom: BTreeMap<String, String> = match self.custom_json.as_deref() {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| Error::internal(format!("corrupt custom field map: {e}")))?,
            None => BTreeMap::new(),
        };
        Ok(Task {
            id: TaskId::parse(&self.id)?,
            title: self.title,
            task_type: TaskType::parse(&self.task_type)?,
            status: TaskStatus::parse(&self.status)?,
            priority: self.priority.clamp(0, 4) as u8,
            description: self.description,
            acceptance: self.acceptance,
            assignee: self.assignee,
            parent: self.parent_id.as_deref().map(TaskId::parse).transpose()?,
            spec_id: self.spec_id,
            source_repo: self.source_repo,
            labels,
            custom,
            deps,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            closed_at: self.closed_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

async fn fetch_rows_by_ids(conn: &mut SqliteConnection, ids: &[TaskId]) -> Result<Vec<TaskRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id IN ("
    ));
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.as_str());
    }
    qb.push(")");
    qb.build_query_as::<TaskRow>()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)
}

/// Load one task aggregate; `not_found` if the row is absent.
pub(crate) async fn load_task(conn: &mut SqliteConnection, id: &TaskId) -> Result<Task> {
    let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row = sqlx::query_as::<_, TaskRow>(&query)
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("task not found: {id}")))?;

    let tasks = load_details(conn, vec![row]).await?;
    tasks
        .into_iter()
        .next()
        .ok_or_else(|| Error::internal("task aggregate vanished during load"))
}

/// Attach labels and dep edges to raw task rows, preserving row order.
pub(crate) async fn load_details(
    conn: &mut SqliteConnection,
    rows: Vec<TaskRow>,
) -> Result<Vec<Task>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT task_id, label FROM task_labels WHERE task_id IN (",
    );
    let mut sep = qb.separated(", ");
    for id in &ids {
        sep.push_bind(*id);
    }
    qb.push(") ORDER BY label");
    let label_rows: Vec<(String, String)> = qb
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT child_id, parent_id, dep_type FROM task_deps WHERE child_id IN (",
    );
    let mut sep = qb.separated(", ");
    for id in &ids {
        sep.push_bind(*id);
    }
    qb.push(") ORDER BY parent_id");
    let dep_rows: Vec<(String, String, String)> = qb
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

    let mut labels_by_task: HashMap<String, Vec<String>> = HashMap::new();
    for (task_id, label) in label_rows {
        labels_by_task.entry(task_id).or_default().push(label);
    }
    let mut deps_by_task: HashMap<String, Vec<DepEdge>> = HashMap::new();
    for (child_id, parent_id, dep_type) in dep_rows {
        deps_by_task.entry(child_id).or_default().push(DepEdge {
            parent_id: TaskId::parse(&parent_id)?,
            dep_type,
        });
    }

    rows.into_iter()
        .map(|row| {
            let labels = labels_by_task.remove(&row.id).unwrap_or_default();
            let deps = deps_by_task.remove(&row.id).unwrap_or_default();
            row.into_task(labels, deps)
        })
        .collect()
}

/// Ids of all tasks currently in the store.
pub(crate) async fn existing_ids(conn: &mut SqliteConnection) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM tasks")
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[derive(sqlx::FromRow)]
struct GitRefRow {
    id: String,
    task_id: String,
    repo: String,
    relation: String,
    object_type: String,
    object_value: String,
    resolved_commit: String,
    note: Option<String>,
    meta_json: Option<String>,
    created_at: i64,
}

impl GitRefRow {
    fn into_git_ref(self) -> Result<GitRef> {
        let meta = self
            .meta_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| Error::internal(format!("corrupt git ref meta: {e}")))?;
        Ok(GitRef {
            id: GitRefId::parse(&self.id)?,
            task_id: TaskId::parse(&self.task_id)?,
            repo: self.repo,
            relation: self.relation,
            object_type: GitObjectType::parse(&self.object_type)?,
            object_value: self.object_value,
            resolved_commit: self.resolved_commit,
            note: self.note,
            meta,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        })
    }
}

async fn load_git_ref(conn: &mut SqliteConnection, ref_id: &GitRefId) -> Result<GitRef> {
    let query = format!("SELECT {GIT_REF_COLUMNS} FROM task_git_refs WHERE id = ?1");
    let row = sqlx::query_as::<_, GitRefRow>(&query)
        .bind(ref_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("git ref not found: {ref_id}")))?;
    row.into_git_ref()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) struct TestStorage {
        pub storage: Storage,
        _dir: TempDir,
    }

    pub(crate) async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path, "gr").await.unwrap();
        storage.migrate().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn basic_create(title: &str) -> CreateTask {
        CreateTask {
            title: title.to_string(),
            status: TaskStatus::Open,
            priority: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Auth")).await.unwrap();

        assert!(TaskId::parse(task.id.as_str()).is_ok());
        assert_eq!(task.title, "Auth");
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(task.priority, 2);
        assert!(task.closed_at.is_none());
        assert_eq!(task.created_at, task.updated_at);

        let fetched = ts.storage.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.title, task.title);
    }

    #[tokio::test]
    async fn create_with_client_id_conflicts_on_dup() {
        let ts = create_test_storage().await;
        let id = TaskId::parse("gr-ab12").unwrap();

        let mut req = basic_create("First");
        req.id = Some(id.clone());
        ts.storage.create_task(req).await.unwrap();

        let mut req = basic_create("Second");
        req.id = Some(id);
        let err = ts.storage.create_task(req).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn labels_stored_sorted_and_deduped() {
        let ts = create_test_storage().await;
        let mut req = basic_create("Labeled");
        req.labels = canon::labels(["Bug", "bug", "Auth"]);
        let task = ts.storage.create_task(req).await.unwrap();
        assert_eq!(task.labels, vec!["auth", "bug"]);
    }

    #[tokio::test]
    async fn update_patch_preserves_absent_fields() {
        let ts = create_test_storage().await;
        let mut req = basic_create("Original");
        req.description = Some("desc".into());
        let task = ts.storage.create_task(req).await.unwrap();

        let updated = ts
            .storage
            .update_task(
                &task.id,
                TaskPatch {
                    priority: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.priority, 4);
        assert_eq!(updated.title, "Original");
        assert_eq!(updated.description.as_deref(), Some("desc"));
        assert_eq!(updated.created_at, task.created_at);
        assert!(updated.updated_at >= task.updated_at);
    }

    #[tokio::test]
    async fn update_rejects_empty_patch() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("NoOp")).await.unwrap();
        let err = ts
            .storage
            .update_task(&task.id, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.to_string(), "no fields to update");
    }

    #[tokio::test]
    async fn status_transitions_manage_closed_at() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Lifecycle")).await.unwrap();

        let closed = ts
            .storage
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Closed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(closed.status, TaskStatus::Closed);
        assert!(closed.closed_at.is_some());

        let reopened = ts
            .storage
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Open),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);
        assert!(reopened.closed_at.is_none());
    }

    #[tokio::test]
    async fn close_batch_is_all_or_nothing() {
        let ts = create_test_storage().await;
        let a = ts.storage.create_task(basic_create("A")).await.unwrap();
        let b = ts.storage.create_task(basic_create("B")).await.unwrap();
        let missing = TaskId::parse("gr-zzzz").unwrap();

        let err = ts
            .storage
            .close_tasks(&[a.id.clone(), b.id.clone(), missing], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Neither task was touched.
        assert_eq!(
            ts.storage.get_task(&a.id).await.unwrap().status,
            TaskStatus::Open
        );
        assert_eq!(
            ts.storage.get_task(&b.id).await.unwrap().status,
            TaskStatus::Open
        );
    }

    #[tokio::test]
    async fn close_with_commit_annotates_once() {
        let ts = create_test_storage().await;
        let mut req = basic_create("Annotated");
        req.source_repo = Some("github.com/acme/repo".into());
        let task = ts.storage.create_task(req).await.unwrap();

        let annotation = CloseAnnotation {
            commit: "a".repeat(40),
            repo: None,
        };
        let first = ts
            .storage
            .close_tasks(&[task.id.clone()], Some(annotation.clone()))
            .await
            .unwrap();
        assert_eq!(first.closed, 1);
        assert_eq!(first.annotated, 1);

        // Re-close with the same commit: idempotent, nothing new.
        let second = ts
            .storage
            .close_tasks(&[task.id.clone()], Some(annotation))
            .await
            .unwrap();
        assert_eq!(second.closed, 0);
        assert_eq!(second.annotated, 0);

        let refs = ts.storage.list_git_refs(&task.id).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].relation, RELATION_CLOSED_BY);
        assert_eq!(refs[0].repo, "github.com/acme/repo");
    }

    #[tokio::test]
    async fn close_without_repo_anywhere_fails_before_writes() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("NoRepo")).await.unwrap();

        let err = ts
            .storage
            .close_tasks(
                &[task.id.clone()],
                Some(CloseAnnotation {
                    commit: "b".repeat(40),
                    repo: None,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let unchanged = ts.storage.get_task(&task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Open);
        assert!(ts.storage.list_git_refs(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen_clears_closed_at_and_keeps_annotations() {
        let ts = create_test_storage().await;
        let mut req = basic_create("Reopen");
        req.source_repo = Some("github.com/acme/repo".into());
        let task = ts.storage.create_task(req).await.unwrap();

        ts.storage
            .close_tasks(
                &[task.id.clone()],
                Some(CloseAnnotation {
                    commit: "c".repeat(40),
                    repo: None,
                }),
            )
            .await
            .unwrap();

        let reopened = ts.storage.reopen_tasks(&[task.id.clone()]).await.unwrap();
        assert_eq!(reopened, 1);

        let fetched = ts.storage.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Open);
        assert!(fetched.closed_at.is_none());
        assert_eq!(ts.storage.list_git_refs(&task.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dep_add_is_idempotent_and_remove_is_noop_safe() {
        let ts = create_test_storage().await;
        let parent = ts.storage.create_task(basic_create("Parent")).await.unwrap();
        let child = ts.storage.create_task(basic_create("Child")).await.unwrap();

        let after_first = ts.storage.add_dep(&child.id, &parent.id).await.unwrap();
        assert_eq!(after_first.deps.len(), 1);
        let after_second = ts.storage.add_dep(&child.id, &parent.id).await.unwrap();
        assert_eq!(after_second.deps.len(), 1);

        let removed = ts.storage.remove_dep(&child.id, &parent.id).await.unwrap();
        assert!(removed.deps.is_empty());
        // Removing again is a no-op success.
        ts.storage.remove_dep(&child.id, &parent.id).await.unwrap();
    }

    #[tokio::test]
    async fn dep_rejects_self_loop_and_missing_parent() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Solo")).await.unwrap();

        let err = ts.storage.add_dep(&task.id, &task.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let missing = TaskId::parse("gr-none").unwrap();
        let err = ts.storage.add_dep(&task.id, &missing).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_task_cascades() {
        let ts = create_test_storage().await;
        let mut req = basic_create("Owner");
        req.source_repo = Some("github.com/acme/repo".into());
        req.labels = vec!["bug".into()];
        let task = ts.storage.create_task(req).await.unwrap();
        let other = ts.storage.create_task(basic_create("Other")).await.unwrap();
        ts.storage.add_dep(&other.id, &task.id).await.unwrap();

        let git_ref = ts
            .storage
            .insert_git_ref(
                &task.id,
                NewGitRef {
                    repo: None,
                    relation: "related".into(),
                    object_type: GitObjectType::Commit,
                    object_value: "d".repeat(40),
                    resolved_commit: None,
                    note: None,
                    meta: None,
                },
            )
            .await
            .unwrap();

        ts.storage.delete_task(&task.id).await.unwrap();

        assert!(matches!(
            ts.storage.get_task(&task.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            ts.storage.get_git_ref(&git_ref.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
        // Parent-side edge on the surviving task is gone too.
        let surviving = ts.storage.get_task(&other.id).await.unwrap();
        assert!(surviving.deps.is_empty());
    }

    #[tokio::test]
    async fn git_ref_duplicate_key_conflicts() {
        let ts = create_test_storage().await;
        let mut req = basic_create("RefHost");
        // source_repo arrives canonical from the ingress layer.
        req.source_repo = Some("github.com/acme/repo".into());
        let task = ts.storage.create_task(req).await.unwrap();

        let new_ref = || NewGitRef {
            repo: None,
            relation: "related".into(),
            object_type: GitObjectType::Commit,
            object_value: "A".repeat(40),
            resolved_commit: None,
            note: None,
            meta: None,
        };

        let created = ts.storage.insert_git_ref(&task.id, new_ref()).await.unwrap();
        assert_eq!(created.repo, "github.com/acme/repo");
        assert_eq!(created.object_value, "a".repeat(40));

        let err = ts
            .storage
            .insert_git_ref(&task.id, new_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn git_ref_equivalent_repo_forms_collide() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Repo")).await.unwrap();

        let make = |repo: &str| NewGitRef {
            repo: Some(repo.to_string()),
            relation: "related".into(),
            object_type: GitObjectType::Commit,
            object_value: "e".repeat(40),
            resolved_commit: None,
            note: None,
            meta: None,
        };

        ts.storage
            .insert_git_ref(&task.id, make("https://github.com/acme/repo"))
            .await
            .unwrap();
        let err = ts
            .storage
            .insert_git_ref(&task.id, make("git@github.com:acme/repo.git"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn git_ref_absent_and_empty_resolved_commit_collide() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Resolved")).await.unwrap();

        let make = |resolved: Option<&str>| NewGitRef {
            repo: Some("github.com/acme/repo".into()),
            relation: "related".into(),
            object_type: GitObjectType::Branch,
            object_value: "main".into(),
            resolved_commit: resolved.map(String::from),
            note: None,
            meta: None,
        };

        ts.storage.insert_git_ref(&task.id, make(None)).await.unwrap();
        let err = ts
            .storage
            .insert_git_ref(&task.id, make(Some("")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn git_ref_requires_some_repo() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(basic_create("Bare")).await.unwrap();

        let err = ts
            .storage
            .insert_git_ref(
                &task.id,
                NewGitRef {
                    repo: None,
                    relation: "design_doc".into(),
                    object_type: GitObjectType::Path,
                    object_value: "docs/design.md".into(),
                    resolved_commit: None,
                    note: None,
                    meta: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("required"));
    }

    #[tokio::test]
    async fn batch_get_returns_requested_order() {
        let ts = create_test_storage().await;
        let a = ts.storage.create_task(basic_create("A")).await.unwrap();
        let b = ts.storage.create_task(basic_create("B")).await.unwrap();

        let tasks = ts
            .storage
            .get_tasks_ordered(&[b.id.clone(), a.id.clone()])
            .await
            .unwrap();
        assert_eq!(tasks[0].id, b.id);
        assert_eq!(tasks[1].id, a.id);

        let missing = TaskId::parse("gr-zzzz").unwrap();
        let err = ts
            .storage
            .get_tasks_ordered(&[a.id.clone(), missing])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_creates_with_same_id_yield_one_winner() {
        let ts = create_test_storage().await;
        let storage = std::sync::Arc::new(ts.storage);

        let mut handles = Vec::new();
        for i in 0..8 {
            let storage = std::sync::Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let mut req = basic_create(&format!("racer {i}"));
                req.id = Some(TaskId::parse("gr-race").unwrap());
                storage.create_task(req).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
    }
}
