//! List/search query evaluation.
//!
//! Filters compose with AND and are pushed into SQL wherever possible; the
//! spec-id regex is the one filter applied in Rust, after the ordered fetch,
//! so pagination stays deterministic either way.

use chrono::{DateTime, Duration, Utc};
use grns_core::{Error, Result, Task, TaskStatus, TaskType};
use regex::Regex;
use sqlx::{QueryBuilder, Sqlite};

use crate::storage::{self, Storage, TASK_COLUMNS};

/// Composed list filter. Empty vectors and `None` fields mean "no constraint".
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Task labels must be a superset of these (label-AND).
    pub labels_all: Vec<String>,
    /// Task labels must intersect these (label-ANY).
    pub labels_any: Vec<String>,
    /// Status must be one of these. When empty, tombstones are hidden.
    pub statuses: Vec<TaskStatus>,
    pub task_type: Option<TaskType>,
    /// Regex over `spec_id`; invalid patterns are rejected up front.
    pub spec_regex: Option<String>,
    pub updated_before: Option<DateTime<Utc>>,
    /// Full-text query over title/description/acceptance.
    pub search: Option<String>,
    /// Only tasks that are open/in_progress with no unresolved parents.
    pub ready: bool,
    /// Only tasks untouched for at least this many days.
    pub stale_days: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Storage {
    /// Evaluate a list query. Default order is `updated_at DESC, id ASC`,
    /// stable across pages.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        if filter.limit.is_some_and(|l| l < 0) {
            return Err(Error::invalid("limit must be non-negative"));
        }
        if filter.offset.is_some_and(|o| o < 0) {
            return Err(Error::invalid("offset must be non-negative"));
        }
        let spec_regex = filter
            .spec_regex
            .as_deref()
            .map(|raw| Regex::new(raw).map_err(|_| Error::invalid("invalid spec regex")))
            .transpose()?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"
        ));

        if filter.statuses.is_empty() {
            // Tombstones are soft-deleted; hide them unless asked for.
            qb.push(" AND status != ").push_bind(TaskStatus::Tombstone.as_str());
            if filter.stale_days.is_some() {
                qb.push(" AND status != ").push_bind(TaskStatus::Closed.as_str());
            }
        } else {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in &filter.statuses {
                sep.push_bind(status.as_str());
            }
            qb.push(")");
        }

        if let Some(task_type) = filter.task_type {
            qb.push(" AND type = ").push_bind(task_type.as_str());
        }

        if let Some(cutoff) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(cutoff.timestamp_millis());
        }

        if let Some(days) = filter.stale_days {
            let cutoff = Utc::now() - Duration::days(days);
            qb.push(" AND updated_at < ").push_bind(cutoff.timestamp_millis());
        }

        if !filter.labels_all.is_empty() {
            qb.push(
                " AND (SELECT COUNT(DISTINCT label) FROM task_labels \
                 WHERE task_id = tasks.id AND label IN (",
            );
            let mut sep = qb.separated(", ");
            for label in &filter.labels_all {
                sep.push_bind(label);
            }
            qb.push(")) = ").push_bind(filter.labels_all.len() as i64);
        }

        if !filter.labels_any.is_empty() {
            qb.push(
                " AND EXISTS (SELECT 1 FROM task_labels \
                 WHERE task_id = tasks.id AND label IN (",
            );
            let mut sep = qb.separated(", ");
            for label in &filter.labels_any {
                sep.push_bind(label);
            }
            qb.push("))");
        }

        if let Some(search) = &filter.search {
            qb.push(" AND tasks.rowid IN (SELECT rowid FROM tasks_fts WHERE tasks_fts MATCH ")
                .push_bind(search)
                .push(")");
        }

        if filter.ready {
            qb.push(" AND status IN ('open', 'in_progress')");
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM task_deps d JOIN tasks p ON p.id = d.parent_id \
                 WHERE d.child_id = tasks.id AND p.status != 'closed')",
            );
        }

        qb.push(" ORDER BY updated_at DESC, id ASC");

        // With a spec regex in play, pagination happens after the Rust-side
        // filter; otherwise SQL slices the page.
        if spec_regex.is_none() {
            match (filter.limit, filter.offset) {
                (Some(limit), Some(offset)) => {
                    qb.push(" LIMIT ").push_bind(limit);
                    qb.push(" OFFSET ").push_bind(offset);
                }
                (Some(limit), None) => {
                    qb.push(" LIMIT ").push_bind(limit);
                }
                (None, Some(offset)) => {
                    qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
                }
                (None, None) => {}
            }
        }

        let mut conn = self.pool().acquire().await.map_err(storage::db_err)?;
        let rows = qb
            .build_query_as::<storage::TaskRow>()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| {
                // FTS5 reports malformed MATCH expressions as a plain query
                // error at execution time.
                if filter.search.is_some() && matches!(e, sqlx::Error::Database(_)) {
                    Error::invalid("invalid search query")
                } else {
                    storage::db_err(e)
                }
            })?;

        let mut tasks = storage::load_details(&mut conn, rows).await?;

        if let Some(regex) = spec_regex {
            tasks.retain(|t| t.spec_id.as_deref().is_some_and(|s| regex.is_match(s)));
            let start = (filter.offset.unwrap_or(0) as usize).min(tasks.len());
            let end = match filter.limit {
                Some(limit) => (start + limit as usize).min(tasks.len()),
                None => tasks.len(),
            };
            tasks.truncate(end);
            return Ok(tasks.split_off(start));
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::create_test_storage;
    use crate::storage::{CreateTask, TaskPatch};
    use grns_core::{canon, TaskId};

    fn seed(title: &str, labels: &[&str]) -> CreateTask {
        CreateTask {
            title: title.to_string(),
            priority: 2,
            labels: canon::labels(labels.iter().copied()),
            ..Default::default()
        }
    }

    async fn backdate(storage: &Storage, id: &TaskId, days: i64) {
        let ts = (Utc::now() - Duration::days(days)).timestamp_millis();
        sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE id = ?2")
            .bind(ts)
            .bind(id.as_str())
            .execute(storage.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn label_and_requires_superset() {
        let ts = create_test_storage().await;
        ts.storage
            .create_task(seed("Fix auth bug", &["bug", "auth"]))
            .await
            .unwrap();
        ts.storage
            .create_task(seed("Other bug", &["bug"]))
            .await
            .unwrap();

        let filter = TaskFilter {
            labels_all: vec!["bug".into(), "auth".into()],
            ..Default::default()
        };
        let results = ts.storage.list_tasks(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Fix auth bug");
    }

    #[tokio::test]
    async fn label_any_requires_intersection() {
        let ts = create_test_storage().await;
        ts.storage
            .create_task(seed("Fix auth bug", &["bug", "auth"]))
            .await
            .unwrap();
        ts.storage
            .create_task(seed("Add settings page", &["frontend"]))
            .await
            .unwrap();
        ts.storage
            .create_task(seed("Unrelated", &["infra"]))
            .await
            .unwrap();

        let filter = TaskFilter {
            labels_any: vec!["auth".into(), "frontend".into()],
            ..Default::default()
        };
        let titles: Vec<String> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert!(titles.contains(&"Fix auth bug".to_string()));
        assert!(titles.contains(&"Add settings page".to_string()));
        assert_eq!(titles.len(), 2);
    }

    #[tokio::test]
    async fn status_set_and_type_filters() {
        let ts = create_test_storage().await;
        let open = ts.storage.create_task(seed("Open", &[])).await.unwrap();
        let closed = ts.storage.create_task(seed("Closed", &[])).await.unwrap();
        ts.storage
            .close_tasks(&[closed.id.clone()], None)
            .await
            .unwrap();

        let filter = TaskFilter {
            statuses: vec![TaskStatus::Open, TaskStatus::Closed],
            ..Default::default()
        };
        let ids: Vec<_> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&open.id));
        assert!(ids.contains(&closed.id));

        let filter = TaskFilter {
            task_type: Some(TaskType::Bug),
            ..Default::default()
        };
        assert!(ts.storage.list_tasks(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tombstones_hidden_unless_requested() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(seed("Ghost", &[])).await.unwrap();
        ts.storage
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Tombstone),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(ts
            .storage
            .list_tasks(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());

        let filter = TaskFilter {
            statuses: vec![TaskStatus::Tombstone],
            ..Default::default()
        };
        assert_eq!(ts.storage.list_tasks(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ordering_is_updated_desc_then_id() {
        let ts = create_test_storage().await;
        let first = ts.storage.create_task(seed("First", &[])).await.unwrap();
        let second = ts.storage.create_task(seed("Second", &[])).await.unwrap();
        backdate(&ts.storage, &first.id, 1).await;

        let results = ts.storage.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(results[0].id, second.id);
        assert_eq!(results[1].id, first.id);
    }

    #[tokio::test]
    async fn pagination_yields_each_task_once() {
        let ts = create_test_storage().await;
        for i in 0..7 {
            ts.storage
                .create_task(seed(&format!("Task {i}"), &[]))
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut offset = 0;
        loop {
            let filter = TaskFilter {
                limit: Some(3),
                offset: Some(offset),
                ..Default::default()
            };
            let page = ts.storage.list_tasks(&filter).await.unwrap();
            if page.is_empty() {
                break;
            }
            for task in &page {
                assert!(seen.insert(task.id.clone()), "duplicate {:?}", task.id);
            }
            offset += 3;
        }
        assert_eq!(seen.len(), 7);
    }

    #[tokio::test]
    async fn negative_limit_and_offset_rejected() {
        let ts = create_test_storage().await;
        let filter = TaskFilter {
            limit: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            ts.storage.list_tasks(&filter).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
        let filter = TaskFilter {
            offset: Some(-2),
            ..Default::default()
        };
        assert!(matches!(
            ts.storage.list_tasks(&filter).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn spec_regex_filters_and_rejects_malformed() {
        let ts = create_test_storage().await;
        let mut req = seed("Auth", &[]);
        req.spec_id = Some("specs/auth.md".into());
        ts.storage.create_task(req).await.unwrap();
        let mut req = seed("Cache", &[]);
        req.spec_id = Some("specs/cache.md".into());
        ts.storage.create_task(req).await.unwrap();

        let filter = TaskFilter {
            spec_regex: Some(r"auth\.md".into()),
            ..Default::default()
        };
        let results = ts.storage.list_tasks(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Auth");

        let filter = TaskFilter {
            spec_regex: Some("[".into()),
            ..Default::default()
        };
        let err = ts.storage.list_tasks(&filter).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid spec regex");
    }

    #[tokio::test]
    async fn search_matches_title_and_description() {
        let ts = create_test_storage().await;
        let mut req = seed("Authentication module", &[]);
        req.description = Some("Implement OAuth login".into());
        let auth = ts.storage.create_task(req).await.unwrap();
        let mut req = seed("Caching layer", &[]);
        req.description = Some("Redis integration".into());
        ts.storage.create_task(req).await.unwrap();

        let filter = TaskFilter {
            search: Some("authentication".into()),
            ..Default::default()
        };
        let results = ts.storage.list_tasks(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, auth.id);

        let filter = TaskFilter {
            search: Some("OAuth".into()),
            ..Default::default()
        };
        let results = ts.storage.list_tasks(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, auth.id);
    }

    #[tokio::test]
    async fn search_composes_with_status_filter() {
        let ts = create_test_storage().await;
        let closed = ts
            .storage
            .create_task(seed("Searchable open", &[]))
            .await
            .unwrap();
        ts.storage.close_tasks(&[closed.id], None).await.unwrap();
        let open = ts
            .storage
            .create_task(seed("Searchable still open", &[]))
            .await
            .unwrap();

        let filter = TaskFilter {
            search: Some("searchable".into()),
            statuses: vec![TaskStatus::Open],
            ..Default::default()
        };
        let results = ts.storage.list_tasks(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, open.id);
    }

    #[tokio::test]
    async fn search_tracks_updates_to_text_columns() {
        let ts = create_test_storage().await;
        let task = ts.storage.create_task(seed("Plain title", &[])).await.unwrap();

        ts.storage
            .update_task(
                &task.id,
                TaskPatch {
                    title: Some("Distinctive headline".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let filter = TaskFilter {
            search: Some("distinctive".into()),
            ..Default::default()
        };
        assert_eq!(ts.storage.list_tasks(&filter).await.unwrap().len(), 1);

        let filter = TaskFilter {
            search: Some("plain".into()),
            ..Default::default()
        };
        assert!(ts.storage.list_tasks(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_search_query_rejected() {
        let ts = create_test_storage().await;
        ts.storage.create_task(seed("Some task", &[])).await.unwrap();

        let filter = TaskFilter {
            search: Some("\"".into()),
            ..Default::default()
        };
        let err = ts.storage.list_tasks(&filter).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid search query");
    }

    #[tokio::test]
    async fn stale_excludes_closed_unless_status_given() {
        let ts = create_test_storage().await;
        let open = ts.storage.create_task(seed("Stale open", &[])).await.unwrap();
        let closed = ts.storage.create_task(seed("Stale closed", &[])).await.unwrap();
        ts.storage
            .close_tasks(&[closed.id.clone()], None)
            .await
            .unwrap();
        backdate(&ts.storage, &open.id, 40).await;
        backdate(&ts.storage, &closed.id, 40).await;

        let filter = TaskFilter {
            stale_days: Some(30),
            ..Default::default()
        };
        let ids: Vec<_> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&open.id));
        assert!(!ids.contains(&closed.id));

        let filter = TaskFilter {
            stale_days: Some(30),
            statuses: vec![TaskStatus::Closed],
            ..Default::default()
        };
        let ids: Vec<_> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&closed.id));
    }

    #[tokio::test]
    async fn ready_requires_resolved_parents() {
        let ts = create_test_storage().await;
        let parent = ts.storage.create_task(seed("Blocker", &[])).await.unwrap();
        let child = ts.storage.create_task(seed("Blocked", &[])).await.unwrap();
        ts.storage.add_dep(&child.id, &parent.id).await.unwrap();

        let filter = TaskFilter {
            ready: true,
            ..Default::default()
        };
        let ids: Vec<_> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&parent.id));
        assert!(!ids.contains(&child.id));

        ts.storage
            .close_tasks(&[parent.id.clone()], None)
            .await
            .unwrap();
        let ids: Vec<_> = ts
            .storage
            .list_tasks(&filter)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(ids.contains(&child.id));
    }

    #[tokio::test]
    async fn dep_cycle_renders_both_not_ready() {
        let ts = create_test_storage().await;
        let a = ts.storage.create_task(seed("A", &[])).await.unwrap();
        let b = ts.storage.create_task(seed("B", &[])).await.unwrap();
        ts.storage.add_dep(&a.id, &b.id).await.unwrap();
        ts.storage.add_dep(&b.id, &a.id).await.unwrap();

        let filter = TaskFilter {
            ready: true,
            ..Default::default()
        };
        assert!(ts.storage.list_tasks(&filter).await.unwrap().is_empty());
    }
}
