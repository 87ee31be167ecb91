//! Line-oriented import/export of the task graph.
//!
//! Export writes one JSON-serialized task per line, ordered by id. Import
//! applies records under a single transaction so dry runs can roll back and a
//! stream parse failure never leaves a half-applied file behind. Dep edges are
//! applied after the scalar pass so forward references within one batch
//! resolve regardless of record order.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use grns_core::transfer::{DedupePolicy, ImportOptions, ImportRecord, ImportReport, RawDep};
use grns_core::{canon, Error, Result, Task, TaskId, TaskStatus, TaskType, DEP_TYPE_BLOCKS};
use sqlx::Sqlite;

use crate::storage::{self, Storage, TASK_COLUMNS};

/// Serialize tasks as newline-delimited JSON, one record per line.
pub fn render_export(tasks: &[Task]) -> Result<String> {
    let mut out = String::new();
    for task in tasks {
        let line = serde_json::to_string(task)
            .map_err(|e| Error::internal(format!("serialize export record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// A record that survived the scalar pass and owns its dep list.
struct DepJob {
    line: usize,
    id: TaskId,
    deps: Option<Vec<RawDep>>,
}

impl Storage {
    /// All tasks in deterministic order (by id), ready for export.
    pub async fn export_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.pool().acquire().await.map_err(storage::db_err)?;
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id");
        let rows = sqlx::query_as::<_, storage::TaskRow>(&query)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage::db_err)?;
        storage::load_details(&mut conn, rows).await
    }

    /// Run an import over NDJSON input.
    ///
    /// Buffered mode parses the whole input before applying; stream mode
    /// parses and applies record by record. Either way a line that fails to
    /// parse aborts the entire import with its 1-based line number.
    pub async fn import_tasks(&self, input: &str, opts: ImportOptions) -> Result<ImportReport> {
        let lines: Vec<(usize, &str)> = input
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .collect();

        let mut tx = self.begin_write().await?;
        let mut report = ImportReport {
            dry_run: opts.dry_run,
            ..Default::default()
        };
        let mut dep_jobs: Vec<DepJob> = Vec::new();

        if opts.stream {
            for (n, line) in lines {
                let record = parse_line(n, line)?;
                apply_record(&mut tx, n, record, &opts, &mut report, &mut dep_jobs).await?;
            }
        } else {
            let mut records = Vec::with_capacity(lines.len());
            for (n, line) in lines {
                records.push((n, parse_line(n, line)?));
            }
            for (n, record) in records {
                apply_record(&mut tx, n, record, &opts, &mut report, &mut dep_jobs).await?;
            }
        }

        // Dep pass: every scalar upsert has landed, so in-batch parents
        // resolve no matter where they appeared in the file.
        let known = storage::existing_ids(&mut tx).await?;
        for job in dep_jobs {
            apply_deps(&mut tx, &job, &known, &opts, &mut report).await?;
        }

        if opts.dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(report)
    }
}

fn parse_line(n: usize, line: &str) -> Result<ImportRecord> {
    serde_json::from_str(line).map_err(|e| Error::invalid(format!("line {n}: {e}")))
}

fn record_error(report: &mut ImportReport, n: usize, err: &Error) {
    report.errors += 1;
    report
        .messages
        .push(format!("line {n}: {err} ({})", err.code()));
}

/// Canonical scalar values extracted from one record.
struct CanonicalRecord {
    id: TaskId,
    title: Option<String>,
    task_type: Option<TaskType>,
    status: Option<TaskStatus>,
    priority: Option<u8>,
    labels: Option<Vec<String>>,
    source_repo: Option<String>,
    parent: Option<TaskId>,
    custom: Option<BTreeMap<String, String>>,
}

fn canonicalize_record(record: &ImportRecord) -> Result<CanonicalRecord> {
    Ok(CanonicalRecord {
        id: TaskId::parse(&record.id)?,
        title: record.title.as_deref().map(canon::title).transpose()?,
        task_type: record
            .task_type
            .as_deref()
            .map(TaskType::parse)
            .transpose()?,
        status: record
            .status
            .as_deref()
            .map(TaskStatus::parse)
            .transpose()?,
        priority: record.priority.map(canon::priority).transpose()?,
        labels: record
            .labels
            .as_ref()
            .map(|l| canon::labels(l.iter().map(String::as_str))),
        source_repo: record
            .source_repo
            .as_deref()
            .map(canon::repo_slug)
            .transpose()?,
        parent: record.parent.as_deref().map(TaskId::parse).transpose()?,
        custom: record.custom.clone(),
    })
}

async fn task_exists(tx: &mut sqlx::Transaction<'_, Sqlite>, id: &TaskId) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?1")
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage::db_err)?;
    Ok(row.is_some())
}

async fn apply_record(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    n: usize,
    record: ImportRecord,
    opts: &ImportOptions,
    report: &mut ImportReport,
    dep_jobs: &mut Vec<DepJob>,
) -> Result<()> {
    let canonical = match canonicalize_record(&record) {
        Ok(c) => c,
        Err(err) => {
            record_error(report, n, &err);
            return Ok(());
        }
    };

    let exists = task_exists(tx, &canonical.id).await?;
    if exists {
        match opts.dedupe {
            DedupePolicy::Skip => {
                report.skipped += 1;
                return Ok(());
            }
            DedupePolicy::Error => {
                record_error(
                    report,
                    n,
                    &Error::conflict(format!("task already exists: {}", canonical.id)),
                );
                return Ok(());
            }
            DedupePolicy::Overwrite => {
                if let Err(err) = overwrite_task(tx, &record, &canonical).await {
                    record_error(report, n, &err);
                    return Ok(());
                }
            }
        }
    } else if let Err(err) = insert_imported(tx, &record, &canonical).await {
        record_error(report, n, &err);
        return Ok(());
    }

    report.created += 1;
    dep_jobs.push(DepJob {
        line: n,
        id: canonical.id,
        deps: record.deps,
    });
    Ok(())
}

async fn insert_imported(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &ImportRecord,
    canonical: &CanonicalRecord,
) -> Result<()> {
    let title = canonical
        .title
        .clone()
        .ok_or_else(|| Error::invalid("title is required"))?;
    let status = canonical.status.unwrap_or_default();
    let created_at = record.created_at.unwrap_or_else(Utc::now);
    let updated_at = record.updated_at.unwrap_or(created_at);
    let closed_at = (status == TaskStatus::Closed)
        .then(|| record.closed_at.or(record.updated_at).unwrap_or_else(Utc::now));
    let custom_json = canonical
        .custom
        .as_ref()
        .filter(|c| !c.is_empty())
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::internal(format!("serialize custom fields: {e}")))?;

    sqlx::query(
        "INSERT INTO tasks (id, title, type, status, priority, description, acceptance, \
         assignee, parent_id, spec_id, source_repo, custom_json, created_at, updated_at, \
         closed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )
    .bind(canonical.id.as_str())
    .bind(&title)
    .bind(canonical.task_type.unwrap_or_default().as_str())
    .bind(status.as_str())
    .bind(i64::from(canonical.priority.unwrap_or(2)))
    .bind(&record.description)
    .bind(&record.acceptance)
    .bind(&record.assignee)
    .bind(canonical.parent.as_ref().map(TaskId::as_str))
    .bind(&record.spec_id)
    .bind(&canonical.source_repo)
    .bind(custom_json)
    .bind(created_at.timestamp_millis())
    .bind(updated_at.timestamp_millis())
    .bind(closed_at.map(|t| t.timestamp_millis()))
    .execute(&mut **tx)
    .await
    .map_err(storage::db_err)?;

    if let Some(labels) = &canonical.labels {
        storage::replace_labels(tx, &canonical.id, labels).await?;
    }
    Ok(())
}

/// Merge a record into an existing task: fields present in the record replace
/// stored values, absent fields are preserved, and `created_at` is immutable.
async fn overwrite_task(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &ImportRecord,
    canonical: &CanonicalRecord,
) -> Result<()> {
    let current = storage::load_task(tx, &canonical.id).await?;

    let status = canonical.status.unwrap_or(current.status);
    let closed_at = if status == TaskStatus::Closed {
        if current.status == TaskStatus::Closed && canonical.status.is_none() {
            current.closed_at
        } else {
            Some(
                record
                    .closed_at
                    .or(record.updated_at)
                    .unwrap_or_else(Utc::now),
            )
        }
    } else {
        None
    };
    let updated_at = record.updated_at.unwrap_or_else(Utc::now);

    let custom = canonical.custom.clone().unwrap_or(current.custom);
    let custom_json = if custom.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&custom)
                .map_err(|e| Error::internal(format!("serialize custom fields: {e}")))?,
        )
    };

    sqlx::query(
        "UPDATE tasks SET title = ?1, type = ?2, status = ?3, priority = ?4, \
         description = ?5, acceptance = ?6, assignee = ?7, parent_id = ?8, spec_id = ?9, \
         source_repo = ?10, custom_json = ?11, updated_at = ?12, closed_at = ?13 \
         WHERE id = ?14",
    )
    .bind(canonical.title.clone().unwrap_or(current.title))
    .bind(canonical.task_type.unwrap_or(current.task_type).as_str())
    .bind(status.as_str())
    .bind(i64::from(canonical.priority.unwrap_or(current.priority)))
    .bind(record.description.clone().or(current.description))
    .bind(record.acceptance.clone().or(current.acceptance))
    .bind(record.assignee.clone().or(current.assignee))
    .bind(
        canonical
            .parent
            .clone()
            .or(current.parent)
            .as_ref()
            .map(TaskId::as_str),
    )
    .bind(record.spec_id.clone().or(current.spec_id))
    .bind(canonical.source_repo.clone().or(current.source_repo))
    .bind(custom_json)
    .bind(updated_at.timestamp_millis())
    .bind(closed_at.map(|t| t.timestamp_millis()))
    .bind(canonical.id.as_str())
    .execute(&mut **tx)
    .await
    .map_err(storage::db_err)?;

    if let Some(labels) = &canonical.labels {
        storage::replace_labels(tx, &canonical.id, labels).await?;
    }
    Ok(())
}

async fn apply_deps(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    job: &DepJob,
    known: &HashSet<String>,
    opts: &ImportOptions,
    report: &mut ImportReport,
) -> Result<()> {
    let Some(deps) = &job.deps else {
        // Absent entirely: existing edges are preserved.
        return Ok(());
    };

    // Present (possibly empty): the record's list replaces the stored set.
    sqlx::query("DELETE FROM task_deps WHERE child_id = ?1")
        .bind(job.id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(storage::db_err)?;

    for dep in deps {
        let parent = match TaskId::parse(&dep.parent_id) {
            Ok(parent) => parent,
            Err(err) => {
                if opts.orphans == grns_core::transfer::OrphanHandling::Strict {
                    record_error(report, job.line, &err);
                }
                continue;
            }
        };
        if parent == job.id {
            continue;
        }
        let dep_type = dep.dep_type.as_deref().unwrap_or(DEP_TYPE_BLOCKS);
        if dep_type != DEP_TYPE_BLOCKS {
            if opts.orphans == grns_core::transfer::OrphanHandling::Strict {
                record_error(
                    report,
                    job.line,
                    &Error::invalid(format!("invalid dep type: {dep_type}")),
                );
            }
            continue;
        }
        if !known.contains(parent.as_str()) {
            if opts.orphans == grns_core::transfer::OrphanHandling::Strict {
                record_error(
                    report,
                    job.line,
                    &Error::invalid(format!("strict orphan dep: {parent}")),
                );
            }
            continue;
        }
        sqlx::query(
            "INSERT OR IGNORE INTO task_deps (child_id, parent_id, dep_type) VALUES (?1, ?2, ?3)",
        )
        .bind(job.id.as_str())
        .bind(parent.as_str())
        .bind(dep_type)
        .execute(&mut **tx)
        .await
        .map_err(storage::db_err)?;
    }
    Ok(())
}
